//! RelayMesh Agent - relay node telemetry reporter
//!
//! Runs on each relay node and periodically pushes a heartbeat to the
//! control plane:
//! - CPU, memory, disk and network counters (sysinfo)
//! - Latency and packet loss to reference targets (system ping)
//! - Bounded retry per push, longer pause after repeated failures

mod config;
mod metrics;
mod report;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::AgentConfig;
use metrics::{probe, SystemSnapshot};
use report::{HeartbeatReport, HeartbeatSink, HttpReporter};

/// Produces one heartbeat per iteration
#[async_trait]
trait MetricsSource: Send + Sync {
    async fn collect(&self) -> Result<HeartbeatReport>;
}

/// Live host metrics plus ping probes
struct HostMetrics {
    node_id: String,
    node_name: String,
    ping_targets: Vec<String>,
    ping_count: u32,
    ping_timeout: Duration,
    cpu_window: Duration,
}

impl HostMetrics {
    fn from_config(config: &AgentConfig) -> Self {
        Self {
            node_id: config.node_id.clone(),
            node_name: config.node_name.clone(),
            ping_targets: config.ping_targets.clone(),
            ping_count: config.ping_count,
            ping_timeout: Duration::from_secs(config.ping_timeout_secs),
            cpu_window: Duration::from_millis(config.cpu_sample_ms),
        }
    }
}

#[async_trait]
impl MetricsSource for HostMetrics {
    async fn collect(&self) -> Result<HeartbeatReport> {
        let (snapshot, latency) = tokio::join!(
            SystemSnapshot::collect(self.cpu_window),
            probe::measure(&self.ping_targets, self.ping_count, self.ping_timeout),
        );
        let snapshot = snapshot.context("collecting system metrics")?;

        info!(
            cpu = snapshot.cpu.usage_percent,
            mem = snapshot.memory.percent,
            latency_ms = ?latency.latency_ms,
            loss = ?latency.packet_loss,
            "collected metrics"
        );

        Ok(HeartbeatReport {
            node_id: self.node_id.clone(),
            node_name: self.node_name.clone(),
            timestamp: Utc::now(),
            cpu: snapshot.cpu,
            memory: snapshot.memory,
            disk: snapshot.disk,
            network: snapshot.network,
            latency_ms: latency.latency_ms,
            packet_loss: latency.packet_loss,
        })
    }
}

/// Consecutive push failures and the wait they imply
#[derive(Debug)]
struct FailureTracker {
    consecutive: u32,
    threshold: u32,
}

impl FailureTracker {
    fn new(threshold: u32) -> Self {
        Self { consecutive: 0, threshold: threshold.max(1) }
    }

    /// Records one iteration and returns how long to wait before the next.
    fn record(&mut self, success: bool, interval: Duration) -> Duration {
        if success {
            self.consecutive = 0;
            return interval;
        }
        self.consecutive += 1;
        if self.consecutive >= self.threshold {
            warn!(failures = self.consecutive, "too many consecutive failures, backing off");
            self.consecutive = 0;
            interval * 3
        } else {
            warn!(failures = self.consecutive, "heartbeat iteration failed");
            interval
        }
    }
}

struct Agent<M, S> {
    source: M,
    sink: S,
    interval: Duration,
    failures: FailureTracker,
}

impl<M: MetricsSource, S: HeartbeatSink> Agent<M, S> {
    fn new(source: M, sink: S, interval: Duration, max_failures: u32) -> Self {
        Self { source, sink, interval, failures: FailureTracker::new(max_failures) }
    }

    async fn run_once(&self) -> Result<()> {
        let report = self.source.collect().await?;
        self.sink.push(&report).await?;
        info!("heartbeat sent");
        Ok(())
    }

    /// One collect + push; never fails, returns the next wait.
    async fn tick(&mut self) -> Duration {
        let outcome = AssertUnwindSafe(self.run_once()).catch_unwind().await;
        let success = match outcome {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(error = %format!("{e:#}"), "heartbeat failed");
                false
            }
            Err(_) => {
                error!("heartbeat iteration panicked");
                false
            }
        };
        self.failures.record(success, self.interval)
    }

    /// Loops until `stop` flips to true; checked between iterations only.
    async fn run(mut self, mut stop: watch::Receiver<bool>) {
        loop {
            let wait = self.tick().await;
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = stop.changed() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AgentConfig::load().await.context("loading agent configuration")?;

    info!("Starting RelayMesh Agent v{}", env!("CARGO_PKG_VERSION"));
    info!(
        node_id = %config.node_id,
        node_name = %config.node_name,
        url = %config.ingest_url,
        interval_secs = config.report_interval_secs,
        "agent configured"
    );
    if config.node_secret.is_none() {
        warn!("NODE_SECRET not set, the control plane will reject heartbeats");
    }

    let reporter = HttpReporter::new(
        config.ingest_url.clone(),
        config.node_secret.clone(),
        Duration::from_secs(config.http_timeout_secs),
    )?
    .with_retry(config.push_attempts, Duration::from_millis(config.retry_backoff_ms));
    let agent = Agent::new(
        HostMetrics::from_config(&config),
        reporter,
        Duration::from_secs(config.report_interval_secs),
        config.max_consecutive_failures,
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    agent.run(stop_rx).await;
    info!("RelayMesh Agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, stopping after current iteration"),
        _ = terminate => info!("received SIGTERM, stopping after current iteration"),
    }
}
