use std::sync::Arc;

use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::debug;

use super::manager::PoolManager;

/// Periodically evict pools idle for longer than the configured threshold.
///
/// The task runs until aborted; abort it before calling
/// [`PoolManager::shutdown`].
pub fn spawn_idle_sweeper(manager: Arc<PoolManager>) -> JoinHandle<()> {
    let period = manager.config().sweep_interval;
    let threshold = manager.config().idle_threshold;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            let evicted = manager
                .evict_idle(threshold, OffsetDateTime::now_utc())
                .await;
            debug!(
                evicted = evicted.len(),
                resident = manager.resident_count(),
                "idle sweep finished"
            );
        }
    })
}
