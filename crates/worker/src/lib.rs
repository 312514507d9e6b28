//! Worker pool services
//!
//! Stateless consumers over the broker's streams: `SttWorker` drains
//! `audio_jobs`, `TranslationWorker` drains `final_transcripts`. Both
//! publish onto the per-session result channels and acknowledge entries
//! only after their results are out, so a crashed peer's work is
//! reclaimable.

pub mod health;
pub mod metrics;
pub mod models;
pub mod stt;
pub mod translate;

pub use models::{
    create_transcriber, create_translator, HttpTranscriber, HttpTranslator, StubTranscriber,
    StubTranslator,
};
pub use stt::SttWorker;
pub use translate::TranslationWorker;

use thiserror::Error;

use voxstream_broker::BrokerError;
use voxstream_core::CoreError;

/// Worker errors
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("model backend error: {0}")]
    Model(String),
}

/// Consumer-group identity for this process.
///
/// Hostname plus a uuid prefix, so claim attribution in `XPENDING` output
/// reads back to a machine.
pub fn consumer_name() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &nonce[..8])
}

/// Initialize tracing from settings (env filter + optional JSON output)
pub fn init_tracing(settings: &voxstream_config::Settings) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("voxstream={}", settings.observability.log_level).into()
    });

    let subscriber = tracing_subscriber::registry().with(env_filter);
    let fmt_layer = if settings.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    subscriber.with(fmt_layer).init();
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
pub async fn shutdown_signal() {
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
            tracing::info!("received Ctrl+C, shutting down");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}
