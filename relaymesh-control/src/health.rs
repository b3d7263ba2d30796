use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;

use crate::error::Result;
use crate::scheduler::{SchedulerHandle, SchedulerStats};
use crate::store::NodeStore;

#[derive(Debug, Serialize)]
pub struct ControlHealth {
    pub uptime_seconds: u64,
    pub nodes_total: usize,
    pub nodes_active: usize,
    pub nodes_stale: usize,
    pub samples_stored: u64,
    pub samples_purged: u64,
    pub heartbeats_accepted: u64,
    pub heartbeats_rejected: u64,
    pub memory_usage_mb: Option<f32>,
    pub scheduler: SchedulerStats,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    heartbeats_accepted: Arc<AtomicU64>,
    heartbeats_rejected: Arc<AtomicU64>,
    samples_purged: Arc<AtomicU64>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            heartbeats_accepted: Arc::new(AtomicU64::new(0)),
            heartbeats_rejected: Arc::new(AtomicU64::new(0)),
            samples_purged: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_heartbeat(&self, accepted: bool) {
        let counter = if accepted { &self.heartbeats_accepted } else { &self.heartbeats_rejected };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_purge(&self, deleted: usize) {
        self.samples_purged.fetch_add(deleted as u64, Ordering::Relaxed);
    }

    pub fn get_health(
        &self,
        store: &NodeStore,
        scheduler: &SchedulerHandle,
        heartbeat_timeout: time::Duration,
    ) -> Result<ControlHealth> {
        let nodes = store.list_nodes()?;
        let now = OffsetDateTime::now_utc();
        let nodes_active = nodes.iter().filter(|n| n.active).count();
        let nodes_stale = nodes
            .iter()
            .filter(|n| n.active)
            .filter(|n| match n.last_heartbeat_at {
                Some(at) => now - at > heartbeat_timeout,
                None => true,
            })
            .count();

        Ok(ControlHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            nodes_total: nodes.len(),
            nodes_active,
            nodes_stale,
            samples_stored: store.sample_count()?,
            samples_purged: self.samples_purged.load(Ordering::Relaxed),
            heartbeats_accepted: self.heartbeats_accepted.load(Ordering::Relaxed),
            heartbeats_rejected: self.heartbeats_rejected.load(Ordering::Relaxed),
            memory_usage_mb: get_memory_usage_mb(),
            scheduler: scheduler.stats(),
        })
    }
}

/// Resident set size from procfs; None off Linux.
fn get_memory_usage_mb() -> Option<f32> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
        let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kb as f32 / 1024.0)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ScoringScheduler;
    use crate::store::tests::node_conf;

    #[test]
    fn test_health_counts_stale_active_nodes() {
        let store = Arc::new(NodeStore::open_in_memory().unwrap());
        store.upsert_node("a", &node_conf("A", 0.0)).unwrap();
        store.upsert_node("b", &node_conf("B", 0.0)).unwrap();
        let mut off = node_conf("C", 0.0);
        off.active = false;
        store.upsert_node("c", &off).unwrap();
        store.record_heartbeat("a", None, OffsetDateTime::now_utc()).unwrap();

        let scheduler = ScoringScheduler::new(store.clone(), &Default::default()).manual();
        let tracker = HealthTracker::new();
        tracker.record_heartbeat(true);
        tracker.record_heartbeat(false);
        tracker.record_purge(4);

        let health = tracker
            .get_health(&store, &scheduler, time::Duration::seconds(300))
            .unwrap();
        assert_eq!(health.nodes_total, 3);
        assert_eq!(health.nodes_active, 2);
        assert_eq!(health.nodes_stale, 1);
        assert_eq!(health.heartbeats_accepted, 1);
        assert_eq!(health.heartbeats_rejected, 1);
        assert_eq!(health.samples_purged, 4);
        assert!(!health.scheduler.enabled);
    }
}
