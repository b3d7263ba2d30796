//! Periodic scoring of active nodes.
//!
//! At most one pass runs at a time. A tick that arrives while a pass is still
//! running is dropped and counted, never queued. Passes run on the blocking
//! pool so the timer keeps ticking while a slow pass overruns.

use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::ControlConfig;
use crate::error::{ControlError, Result};
use crate::scoring::{self, ScoringParams};
use crate::state::{new_state, Shared};
use crate::store::{ScoreStore, ScoreUpdate};

/// Outcome of one scoring pass
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub duration_ms: u64,
    pub nodes_considered: usize,
    pub scored: usize,
    /// No samples in the window; previous score kept
    pub skipped: usize,
    /// Store error or panic while scoring this node
    pub failed: usize,
    pub committed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub enabled: bool,
    pub interval_secs: u64,
    pub running: bool,
    pub passes_started: u64,
    pub passes_completed: u64,
    pub passes_failed: u64,
    pub ticks_skipped: u64,
    pub last_pass: Option<PassReport>,
}

struct SchedulerCore {
    store: Arc<dyn ScoreStore>,
    params: ScoringParams,
    interval: Duration,
    window: time::Duration,
    peak_offset_hours: Option<i8>,
    enabled: AtomicBool,
    running: AtomicBool,
    passes_started: AtomicU64,
    passes_completed: AtomicU64,
    passes_failed: AtomicU64,
    ticks_skipped: AtomicU64,
    last_pass: Shared<Option<PassReport>>,
}

/// Clears the running flag when the pass ends, including by panic.
struct RunGuard(Arc<SchedulerCore>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

impl SchedulerCore {
    /// Idle -> Running, or None if a pass already holds the flag.
    fn begin(self: &Arc<Self>) -> Option<RunGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(Arc::clone(self)))
    }

    fn run_pass(&self) -> Result<PassReport> {
        self.passes_started.fetch_add(1, Ordering::Relaxed);
        let clock = Instant::now();
        let started_at = OffsetDateTime::now_utc();
        let since = started_at - self.window;
        let hour = scoring::local_hour(self.peak_offset_hours);

        let result = self.score_all(started_at, since, hour);
        match &result {
            Ok(_) => {
                self.passes_completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.passes_failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "scoring pass failed, no scores written");
            }
        }

        let (nodes_considered, scored, skipped, failed, committed) = result?;
        let report = PassReport {
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            nodes_considered,
            scored,
            skipped,
            failed,
            committed,
        };
        tracing::info!(
            nodes = report.nodes_considered,
            scored = report.scored,
            skipped = report.skipped,
            failed = report.failed,
            duration_ms = report.duration_ms,
            "scoring pass complete"
        );
        *self.last_pass.lock() = Some(report.clone());
        Ok(report)
    }

    fn score_all(
        &self,
        now: OffsetDateTime,
        since: OffsetDateTime,
        hour: u8,
    ) -> Result<(usize, usize, usize, usize, usize)> {
        let nodes = self.store.active_nodes()?;
        let mut updates = Vec::with_capacity(nodes.len());
        let (mut skipped, mut failed) = (0, 0);

        for node in &nodes {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                let samples = self.store.recent_samples(&node.id, since)?;
                Ok::<_, ControlError>(scoring::score_node(node, &samples, hour, &self.params))
            }));

            match outcome {
                Ok(Ok(Some(breakdown))) => {
                    tracing::debug!(
                        node = %node.id,
                        score = breakdown.score,
                        latency = breakdown.latency,
                        load = breakdown.load,
                        stability = breakdown.stability,
                        penalty = breakdown.penalty,
                        samples = breakdown.samples,
                        "scored node"
                    );
                    updates.push(ScoreUpdate { node_id: node.id.clone(), ai_score: breakdown.score });
                }
                Ok(Ok(None)) => {
                    skipped += 1;
                    tracing::warn!(node = %node.id, "no samples in window, keeping previous score");
                }
                Ok(Err(e)) => {
                    failed += 1;
                    tracing::error!(node = %node.id, error = %e, "failed to score node");
                }
                Err(panic) => {
                    failed += 1;
                    tracing::error!(node = %node.id, panic = panic_message(&*panic), "scoring panicked");
                }
            }
        }

        let committed = self.store.commit_scores(&updates, now)?;
        Ok((nodes.len(), updates.len(), skipped, failed, committed))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Owns the scoring configuration until started.
pub struct ScoringScheduler {
    core: Arc<SchedulerCore>,
}

impl ScoringScheduler {
    pub fn new(store: Arc<dyn ScoreStore>, cfg: &ControlConfig) -> Self {
        Self::with_settings(
            store,
            cfg.scoring.clone(),
            Duration::from_secs(cfg.scheduler.interval_secs),
            time::Duration::minutes(cfg.retention.window_minutes as i64),
            cfg.peak_utc_offset_hours,
        )
    }

    pub fn with_settings(
        store: Arc<dyn ScoreStore>,
        params: ScoringParams,
        interval: Duration,
        window: time::Duration,
        peak_offset_hours: Option<i8>,
    ) -> Self {
        Self {
            core: Arc::new(SchedulerCore {
                store,
                params,
                interval,
                window,
                peak_offset_hours,
                enabled: AtomicBool::new(false),
                running: AtomicBool::new(false),
                passes_started: AtomicU64::new(0),
                passes_completed: AtomicU64::new(0),
                passes_failed: AtomicU64::new(0),
                ticks_skipped: AtomicU64::new(0),
                last_pass: new_state(None),
            }),
        }
    }

    /// Spawns the timer loop. The first pass runs immediately.
    pub fn start(self) -> SchedulerHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let core = Arc::clone(&self.core);
        core.enabled.store(true, Ordering::Release);
        tracing::info!(interval_secs = core.interval.as_secs(), "starting scoring scheduler");

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(core.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(guard) = core.begin() else {
                            core.ticks_skipped.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!("previous scoring pass still running, skipping tick");
                            continue;
                        };
                        let pass_core = Arc::clone(&core);
                        tokio::task::spawn_blocking(move || {
                            let _guard = guard;
                            let _ = pass_core.run_pass();
                        });
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            core.enabled.store(false, Ordering::Release);
            tracing::info!("scoring scheduler stopped");
        });

        SchedulerHandle { core: self.core, stop_tx: Arc::new(stop_tx) }
    }

    /// Handle for manual passes only; no timer is spawned.
    pub fn manual(self) -> SchedulerHandle {
        let (stop_tx, _) = watch::channel(false);
        SchedulerHandle { core: self.core, stop_tx: Arc::new(stop_tx) }
    }
}

#[derive(Clone)]
pub struct SchedulerHandle {
    core: Arc<SchedulerCore>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl SchedulerHandle {
    /// Signals the timer loop and returns at once; an in-flight pass finishes.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Runs a pass now, under the same mutual exclusion as timer ticks.
    pub async fn run_now(&self) -> Result<PassReport> {
        let guard = self.core.begin().ok_or(ControlError::PassInProgress)?;
        let core = Arc::clone(&self.core);
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            core.run_pass()
        })
        .await?
    }

    pub fn stats(&self) -> SchedulerStats {
        let core = &self.core;
        SchedulerStats {
            enabled: core.enabled.load(Ordering::Acquire),
            interval_secs: core.interval.as_secs(),
            running: core.running.load(Ordering::Acquire),
            passes_started: core.passes_started.load(Ordering::Relaxed),
            passes_completed: core.passes_completed.load(Ordering::Relaxed),
            passes_failed: core.passes_failed.load(Ordering::Relaxed),
            ticks_skipped: core.ticks_skipped.load(Ordering::Relaxed),
            last_pass: core.last_pass.lock().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MetricSample, Node};
    use crate::store::tests::{node_conf, sample};
    use crate::store::NodeStore;
    use std::sync::atomic::AtomicUsize;

    /// Takes `delay` per pass and records the highest concurrency seen
    struct SlowStore {
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl SlowStore {
        fn new(delay: Duration) -> Self {
            Self { delay, in_flight: AtomicUsize::new(0), max_in_flight: AtomicUsize::new(0) }
        }
    }

    impl ScoreStore for SlowStore {
        fn active_nodes(&self) -> Result<Vec<Node>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![])
        }

        fn recent_samples(&self, _: &str, _: OffsetDateTime) -> Result<Vec<MetricSample>> {
            Ok(vec![])
        }

        fn commit_scores(&self, _: &[ScoreUpdate], _: OffsetDateTime) -> Result<usize> {
            Ok(0)
        }
    }

    /// Panics while reading samples for one node
    struct PanickyStore {
        inner: NodeStore,
    }

    impl ScoreStore for PanickyStore {
        fn active_nodes(&self) -> Result<Vec<Node>> {
            self.inner.active_nodes()
        }

        fn recent_samples(&self, node_id: &str, since: OffsetDateTime) -> Result<Vec<MetricSample>> {
            if node_id == "bad" {
                panic!("corrupt sample for {node_id}");
            }
            self.inner.recent_samples(node_id, since)
        }

        fn commit_scores(&self, updates: &[ScoreUpdate], at: OffsetDateTime) -> Result<usize> {
            self.inner.commit_scores(updates, at)
        }
    }

    fn seeded_store() -> NodeStore {
        let store = NodeStore::open_in_memory().unwrap();
        store.upsert_node("hk-01", &node_conf("HK-01", 0.3)).unwrap();
        let now = OffsetDateTime::now_utc();
        for latency in [20.0, 30.0, 40.0] {
            store
                .record_heartbeat("hk-01", Some(&sample("hk-01", Some(latency), now)), now)
                .unwrap();
        }
        store
    }

    fn manual(store: Arc<dyn ScoreStore>) -> SchedulerHandle {
        ScoringScheduler::with_settings(
            store,
            ScoringParams::default(),
            Duration::from_secs(60),
            time::Duration::minutes(5),
            Some(0),
        )
        .manual()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overrunning_pass_skips_ticks() {
        let store = Arc::new(SlowStore::new(Duration::from_millis(250)));
        let handle = ScoringScheduler::with_settings(
            store.clone(),
            ScoringParams::default(),
            Duration::from_millis(20),
            time::Duration::minutes(5),
            None,
        )
        .start();

        tokio::time::sleep(Duration::from_millis(600)).await;
        handle.stop();

        let stats = handle.stats();
        assert_eq!(store.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(stats.ticks_skipped > 0);
        assert!(stats.passes_started >= 1);
        assert!(stats.passes_started <= 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_first_pass_runs_at_start() {
        let store = Arc::new(SlowStore::new(Duration::ZERO));
        let handle = ScoringScheduler::with_settings(
            store,
            ScoringParams::default(),
            Duration::from_secs(60),
            time::Duration::minutes(5),
            None,
        )
        .start();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = handle.stats();
        assert!(stats.enabled);
        assert_eq!(stats.passes_started, 1);
        assert_eq!(stats.passes_completed, 1);
        assert!(stats.last_pass.is_some());
        handle.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_passes_after_stop() {
        let store = Arc::new(SlowStore::new(Duration::ZERO));
        let handle = ScoringScheduler::with_settings(
            store,
            ScoringParams::default(),
            Duration::from_millis(20),
            time::Duration::minutes(5),
            None,
        )
        .start();

        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.stop();
        // let the loop observe the signal and any in-flight pass drain
        tokio::time::sleep(Duration::from_millis(100)).await;

        let at_stop = handle.stats();
        assert!(!at_stop.enabled);
        assert!(!at_stop.running);
        assert!(at_stop.passes_started >= 2);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handle.stats().passes_started, at_stop.passes_started);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_now_rejected_while_running() {
        let store = Arc::new(SlowStore::new(Duration::from_millis(300)));
        let handle = manual(store);

        let first = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.run_now().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(handle.run_now().await, Err(ControlError::PassInProgress)));
        assert!(first.await.unwrap().is_ok());
        assert!(handle.run_now().await.is_ok());
    }

    #[tokio::test]
    async fn test_back_to_back_passes_are_idempotent() {
        let store = Arc::new(seeded_store());
        let handle = manual(store.clone());

        handle.run_now().await.unwrap();
        let first = store.get_node("hk-01").unwrap().unwrap().ai_score;
        handle.run_now().await.unwrap();
        let second = store.get_node("hk-01").unwrap().unwrap().ai_score;

        assert_eq!(first, 57.90);
        assert_eq!(first, second);
        assert_eq!(handle.stats().passes_completed, 2);
    }

    #[tokio::test]
    async fn test_node_without_samples_keeps_score() {
        let store = Arc::new(seeded_store());
        store.upsert_node("idle", &node_conf("Idle", 0.0)).unwrap();
        store
            .commit_scores(
                &[ScoreUpdate { node_id: "idle".into(), ai_score: 42.0 }],
                OffsetDateTime::now_utc(),
            )
            .unwrap();

        let report = manual(store.clone()).run_now().await.unwrap();
        assert_eq!(report.scored, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(store.get_node("idle").unwrap().unwrap().ai_score, 42.0);
    }

    #[tokio::test]
    async fn test_panicking_node_is_isolated() {
        let inner = seeded_store();
        inner.upsert_node("bad", &node_conf("Bad", 0.0)).unwrap();
        let store = Arc::new(PanickyStore { inner });

        let handle = manual(store.clone());
        let report = handle.run_now().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.scored, 1);
        assert_eq!(store.inner.get_node("hk-01").unwrap().unwrap().ai_score, 57.90);
        assert!(!handle.stats().running);
    }

    #[test]
    fn test_stats_before_start() {
        let handle = manual(Arc::new(SlowStore::new(Duration::ZERO)));
        let stats = handle.stats();
        assert!(!stats.enabled);
        assert!(stats.last_pass.is_none());
    }
}
