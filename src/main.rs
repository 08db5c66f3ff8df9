use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::info;

use venuebook::clock::SystemClock;
use venuebook::config::Config;
use venuebook::engine::{Engine, TokenSigner};
use venuebook::store::Store;
use venuebook::sweeper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    venuebook::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(Store::open(&config.wal_path())?);
    let engine = Arc::new(Engine::new(
        store.clone(),
        Arc::new(SystemClock),
        TokenSigner::new(&config.token_secret, config.token_ttl_ms),
    ));

    info!("venuebook started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  sweep every {}s", config.sweep_interval.as_secs());
    info!("  compact after {} appends", config.compact_threshold);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let sweep = tokio::spawn(sweeper::run_sweeper(engine.clone(), config.sweep_interval));
    let compact = tokio::spawn(sweeper::run_compactor(store.clone(), config.compact_threshold));

    // Lifecycle events go to the log until a notification consumer is attached.
    let mut events = engine.notify.subscribe_all();
    let log_events = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ev) => tracing::debug!(
                    "booking {} {} -> {}",
                    ev.booking_code,
                    ev.from.map_or("new", |s| s.as_str()),
                    ev.to
                ),
                Err(RecvError::Lagged(n)) => tracing::warn!("event log skipped {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received");
    sweep.abort();
    compact.abort();
    log_events.abort();

    // Leave a compact log behind for the next start.
    if let Err(e) = store.compact().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("venuebook stopped");
    Ok(())
}
