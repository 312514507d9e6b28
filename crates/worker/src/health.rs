//! Worker health listener
//!
//! Minimal liveness/readiness/metrics surface, one per worker process.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;

use voxstream_broker::Broker;

/// Serve `/health`, `/ready` and `/metrics` on the given port
pub fn spawn_health_listener(
    port: u16,
    broker: Arc<dyn Broker>,
    prometheus: PrometheusHandle,
) -> tokio::task::JoinHandle<()> {
    let app = Router::new()
        .route("/health", get(|| async { (StatusCode::OK, "ok") }))
        .route(
            "/ready",
            get(move || {
                let broker = broker.clone();
                async move {
                    match broker.ping().await {
                        Ok(()) => (StatusCode::OK, "ready").into_response(),
                        Err(err) => {
                            tracing::warn!(error = %err, "readiness probe failed");
                            (StatusCode::SERVICE_UNAVAILABLE, "broker unreachable")
                                .into_response()
                        }
                    }
                }
            }),
        )
        .route("/metrics", get(move || async move { prometheus.render() }));

    tokio::spawn(async move {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(error = %err, %addr, "health listener bind failed");
                return;
            }
        };
        tracing::info!("health listener on {addr}");
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error = %err, "health listener failed");
        }
    })
}
