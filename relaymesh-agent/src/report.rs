//! Heartbeat payload and delivery to the control plane.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::metrics::{CpuMetrics, DiskMetrics, MemoryMetrics, NetworkMetrics};

/// Wire payload of `POST /api/v1/node/heartbeat`
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatReport {
    pub node_id: String,
    pub node_name: String,
    pub timestamp: DateTime<Utc>,
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub disk: DiskMetrics,
    pub network: NetworkMetrics,
    /// null when every probe failed
    pub latency_ms: Option<f64>,
    pub packet_loss: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("heartbeat rejected: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("control plane error: HTTP {status}")]
    Server { status: u16 },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl PushError {
    /// 5xx, connect failures and timeouts are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            PushError::Rejected { .. } => false,
            PushError::Server { .. } => true,
            PushError::Transport(e) => e.is_connect() || e.is_timeout(),
        }
    }
}

/// Where heartbeats go
#[async_trait]
pub trait HeartbeatSink: Send + Sync {
    async fn push(&self, report: &HeartbeatReport) -> Result<(), PushError>;
}

/// Backoff before retry number `attempt` (1-based): base, 2*base, 4*base...
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt.saturating_sub(1))
}

pub struct HttpReporter {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
    max_attempts: u32,
    backoff_base: Duration,
}

impl HttpReporter {
    pub fn new(url: impl Into<String>, secret: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("relaymesh-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            secret,
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
        })
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff_base: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff_base = backoff_base;
        self
    }

    async fn send_once(&self, report: &HeartbeatReport) -> Result<(), PushError> {
        let mut req = self.client.post(&self.url).json(report);
        if let Some(secret) = &self.secret {
            req = req.header("x-node-secret", secret);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status.as_u16() == 200 {
            return Ok(());
        }
        if status.is_server_error() {
            return Err(PushError::Server { status: status.as_u16() });
        }
        let body = resp.text().await.unwrap_or_default();
        Err(PushError::Rejected { status: status.as_u16(), body })
    }
}

#[async_trait]
impl HeartbeatSink for HttpReporter {
    async fn push(&self, report: &HeartbeatReport) -> Result<(), PushError> {
        let mut attempt = 1;
        loop {
            match self.send_once(report).await {
                Ok(()) => {
                    debug!(attempt, "heartbeat delivered");
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = retry_delay(self.backoff_base, attempt);
                    warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "heartbeat failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
