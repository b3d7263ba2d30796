use serde::Deserialize;
use time::OffsetDateTime;

/// A relay endpoint eligible for client traffic
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub protocol: String,
    pub active: bool,
    pub load_factor: f64,
    pub ai_score: f64,
    pub secret: Option<String>,
    pub last_heartbeat_at: Option<OffsetDateTime>,
    pub score_updated_at: Option<OffsetDateTime>,
}

/// One immutable health observation of a node
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub node_id: String,
    pub latency_ms: Option<f64>,
    pub packet_loss: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub recorded_at: OffsetDateTime,
    pub reported_at: Option<OffsetDateTime>,
}

// Heartbeat wire format pushed by relaymesh-agent
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatIn {
    pub node_id: String,
    #[serde(default)]
    pub node_name: Option<String>,
    /// RFC 3339 from the agent clock; not trusted for ordering
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub cpu: Option<CpuIn>,
    #[serde(default)]
    pub memory: Option<MemoryIn>,
    #[serde(default)]
    pub disk: Option<DiskIn>,
    #[serde(default)]
    pub network: Option<NetworkIn>,
    /// Absent when every latency probe failed
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub packet_loss: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CpuIn {
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryIn {
    pub total_mb: f64,
    pub used_mb: f64,
    pub percent: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiskIn {
    pub total_gb: f64,
    pub used_gb: f64,
    pub percent: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkIn {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
}
