//! Gateway entry point

use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use voxstream_broker::RedisBroker;
use voxstream_config::{load_settings, Settings};
use voxstream_gateway::{create_health_router, create_router, metrics, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = std::env::var("VOXSTREAM_ENV").ok();
    let settings = match load_settings(env.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            // Tracing not yet initialized, use eprintln for early logging
            eprintln!("Warning: failed to load config: {e}. Using defaults.");
            Settings::default()
        }
    };

    init_tracing(&settings);

    tracing::info!("Starting voxstream gateway v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        environment = ?settings.environment,
        broker = %settings.broker.url,
        "configuration loaded"
    );

    let prometheus = metrics::init_metrics()?;

    // Fatal on a bad endpoint; orchestration restarts the process
    let broker = Arc::new(RedisBroker::connect(&settings.broker.url).await?);
    tracing::info!("broker connected");

    let gateway_port = settings.gateway.port;
    let health_port = settings.gateway.health_port;

    let state = AppState::new(settings, broker);
    let cleanup_shutdown = state.sessions.start_cleanup_task();

    // Health/metrics listener
    let health_app = create_health_router(state.clone(), prometheus);
    let health_addr = SocketAddr::from(([0, 0, 0, 0], health_port));
    let health_listener = tokio::net::TcpListener::bind(health_addr).await?;
    tracing::info!("health listener on {health_addr}");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(health_listener, health_app).await {
            tracing::error!(error = %err, "health listener failed");
        }
    });

    // Client-facing listener
    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], gateway_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = cleanup_shutdown.send(true);
    tracing::info!("gateway shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, initiating graceful shutdown");
        }
    }
}

/// Initialize tracing from settings (env filter + optional JSON output)
fn init_tracing(settings: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "voxstream={},tower_http=info",
            settings.observability.log_level
        )
        .into()
    });

    let subscriber = tracing_subscriber::registry().with(env_filter);
    let fmt_layer = if settings.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    subscriber.with(fmt_layer).init();
}
