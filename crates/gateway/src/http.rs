//! HTTP surface
//!
//! The gateway exposes two listeners: the WebSocket endpoint on the main
//! port, and health/readiness/metrics on the health port.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::websocket::WebSocketHandler;

/// Router for the client-facing WebSocket listener
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(WebSocketHandler::handle))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router for the health/metrics listener
pub fn create_health_router(state: AppState, prometheus: PrometheusHandle) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(move || async move { prometheus.render() }))
        .with_state(state)
}

/// Liveness: the process is up
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness: the broker answers
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.broker.ping().await {
        Ok(()) => (StatusCode::OK, "ready"),
        Err(err) => {
            tracing::warn!(error = %err, "readiness probe failed");
            (StatusCode::SERVICE_UNAVAILABLE, "broker unreachable")
        }
    }
}
