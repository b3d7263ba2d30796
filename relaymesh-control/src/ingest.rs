//! Heartbeat acceptance: node lookup, credential check, range validation,
//! then a single transactional write.

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::ControlConfig;
use crate::error::{ControlError, Result};
use crate::models::{HeartbeatIn, MetricSample};
use crate::store::NodeStore;

/// Accepts one heartbeat and returns the number of samples stored (0 or 1).
///
/// Nothing is written unless every check passes. A report whose own timestamp
/// is older than the scoring window is acknowledged but not stored.
pub fn ingest_heartbeat(
    store: &NodeStore,
    cfg: &ControlConfig,
    presented_secret: Option<&str>,
    report: &HeartbeatIn,
    received_at: OffsetDateTime,
) -> Result<usize> {
    let node = store
        .get_node(&report.node_id)?
        .ok_or_else(|| ControlError::NodeNotFound(report.node_id.clone()))?;
    if !node.active {
        return Err(ControlError::NodeInactive(node.id));
    }

    let Some(expected) = node.secret.as_deref().or(cfg.node_secret.as_deref()) else {
        tracing::warn!(node = %node.id, "no node secret configured, rejecting heartbeat");
        return Err(ControlError::Unauthorized);
    };
    match presented_secret {
        Some(presented) if secrets_match(expected, presented) => {}
        _ => return Err(ControlError::Unauthorized),
    }

    validate_ranges(report)?;

    let reported_at = match report.timestamp.as_deref() {
        Some(ts) => Some(
            OffsetDateTime::parse(ts, &Rfc3339)
                .map_err(|e| ControlError::Validation(format!("timestamp: {e}")))?,
        ),
        None => None,
    };

    let window = time::Duration::minutes(cfg.retention.window_minutes as i64);
    if let Some(at) = reported_at {
        if at < received_at - window {
            tracing::info!(node = %node.id, reported_at = %at, "stale heartbeat replay, not stored");
            return Ok(0);
        }
    }

    if let Some(name) = report.node_name.as_deref() {
        if name != node.name {
            tracing::debug!(node = %node.id, reported = name, "agent reports a different node name");
        }
    }

    let sample = MetricSample {
        node_id: node.id.clone(),
        latency_ms: report.latency_ms,
        packet_loss: report.packet_loss,
        cpu_percent: report.cpu.as_ref().map(|c| c.usage_percent),
        memory_percent: report.memory.as_ref().map(|m| m.percent),
        recorded_at: received_at,
        reported_at,
    };
    let stored = store.record_heartbeat(&node.id, Some(&sample), received_at)?;
    tracing::debug!(
        node = %node.id,
        latency_ms = ?sample.latency_ms,
        mem_used_mb = ?report.memory.as_ref().map(|m| (m.used_mb, m.total_mb)),
        disk_used_gb = ?report.disk.as_ref().map(|d| (d.used_gb, d.total_gb)),
        net = ?report.network.as_ref().map(|n| (n.bytes_sent, n.bytes_recv, n.packets_sent, n.packets_recv)),
        "heartbeat stored"
    );
    Ok(stored)
}

fn validate_ranges(report: &HeartbeatIn) -> Result<()> {
    if let Some(latency) = report.latency_ms {
        if !latency.is_finite() || latency < 0.0 {
            return Err(ControlError::Validation(format!("latency_ms {latency} must be >= 0")));
        }
    }
    if let Some(loss) = report.packet_loss {
        if !(0.0..=1.0).contains(&loss) {
            return Err(ControlError::Validation(format!("packet_loss {loss} outside [0, 1]")));
        }
    }
    let percents = [
        ("cpu.usage_percent", report.cpu.as_ref().map(|c| c.usage_percent)),
        ("memory.percent", report.memory.as_ref().map(|m| m.percent)),
        ("disk.percent", report.disk.as_ref().map(|d| d.percent)),
    ];
    for (field, value) in percents {
        if let Some(v) = value {
            if !(0.0..=100.0).contains(&v) {
                return Err(ControlError::Validation(format!("{field} {v} outside [0, 100]")));
            }
        }
    }
    Ok(())
}

/// Compares without short-circuiting on the first differing byte.
pub(crate) fn secrets_match(expected: &str, presented: &str) -> bool {
    let (a, b) = (expected.as_bytes(), presented.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
