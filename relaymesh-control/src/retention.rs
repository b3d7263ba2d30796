use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::health::HealthTracker;
use crate::store::NodeStore;

/// Deletes samples recorded more than `keep` before `now`.
pub fn sweep_once(store: &NodeStore, keep: time::Duration, now: OffsetDateTime) -> Result<usize> {
    store.purge_samples_before(now - keep)
}

/// Periodic sample purge, independent of the scoring scheduler.
pub fn spawn_retention_sweeper(
    store: Arc<NodeStore>,
    keep: time::Duration,
    every: Duration,
    health: HealthTracker,
) -> JoinHandle<()> {
    tracing::info!(keep_hours = keep.whole_hours(), every_secs = every.as_secs(), "starting retention sweeper");

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;

            let store = Arc::clone(&store);
            let swept = tokio::task::spawn_blocking(move || {
                sweep_once(&store, keep, OffsetDateTime::now_utc())
            })
            .await;

            match swept {
                Ok(Ok(0)) => {}
                Ok(Ok(deleted)) => {
                    health.record_purge(deleted);
                    tracing::info!(deleted, "purged expired samples");
                }
                Ok(Err(e)) => tracing::error!(error = %e, "retention sweep failed"),
                Err(e) => tracing::error!(error = %e, "retention sweep task panicked"),
            }
        }
    })
}
