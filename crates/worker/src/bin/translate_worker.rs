//! Translation worker entry point

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use voxstream_broker::RedisBroker;
use voxstream_config::{load_settings, Settings};
use voxstream_worker::{
    consumer_name, create_translator, health::spawn_health_listener, init_tracing, metrics,
    shutdown_signal, TranslationWorker,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = std::env::var("VOXSTREAM_ENV").ok();
    let settings = match load_settings(env.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Warning: failed to load config: {e}. Using defaults.");
            Settings::default()
        }
    };

    init_tracing(&settings);
    tracing::info!(
        "Starting voxstream translation worker v{}",
        env!("CARGO_PKG_VERSION")
    );

    let prometheus = metrics::init_metrics()?;

    let broker = Arc::new(RedisBroker::connect(&settings.broker.url).await?);
    tracing::info!(broker = %settings.broker.url, "broker connected");

    let translator = create_translator(
        &settings.worker,
        Duration::from_millis(settings.flow.model_deadline_ms),
    )
    .await?;

    spawn_health_listener(settings.gateway.health_port, broker.clone(), prometheus);

    let settings = Arc::new(settings);
    let worker = TranslationWorker::new(
        settings.clone(),
        broker,
        translator,
        consumer_name(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(shutdown_rx));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    handle.await??;
    tracing::info!("translation worker shutdown complete");
    Ok(())
}
