use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::store::Store;

/// Scheduled caller of [`Engine::sweep`]: no-shows and stale pending bookings.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match engine.sweep(engine.now()).await {
            Ok(report) => {
                if report.failures > 0 {
                    tracing::warn!("sweep finished with {} failures", report.failures);
                }
            }
            Err(e) => tracing::error!("sweep failed: {e}"),
        }
    }
}

/// Rewrite the log once enough appends have piled up since the last rewrite.
pub async fn run_compactor(store: Arc<Store>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = store.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact().await {
            Ok(()) => info!("compacted after {appends} appends"),
            Err(e) => tracing::error!("compaction failed: {e}"),
        }
    }
}
