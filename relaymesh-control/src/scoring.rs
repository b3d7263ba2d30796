//! Node quality scoring.
//!
//! A score in [0, 100] is computed from a node's recent samples and its
//! operator-set load factor:
//! - Latency (mean of measured latencies, amplified and capped)
//! - Load (headroom left by `load_factor`)
//! - Stability (1 - mean packet loss, neutral when unknown)
//!
//! A penalty applies when latency spikes during the evening peak.

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

use crate::models::{MetricSample, Node};

/// Tunable scoring constants. `Default` holds the production values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringParams {
    pub latency_weight: f64,
    pub load_weight: f64,
    pub stability_weight: f64,
    /// Multiplier in `100 / (mean_latency + 1) * amplification`
    pub latency_amplification: f64,
    /// Stability sub-score when no sample carries packet loss
    pub neutral_stability: f64,
    /// Inclusive local-hour window
    pub peak_start_hour: u8,
    pub peak_end_hour: u8,
    pub peak_penalty: f64,
    /// Recent mean must exceed `ratio * overall mean` to penalize
    pub peak_ratio: f64,
    pub peak_min_samples: usize,
    pub peak_recent_count: usize,
}

impl Default for ScoringParams {
    fn default() -> Self {
        Self {
            latency_weight: 0.4,
            load_weight: 0.3,
            stability_weight: 0.3,
            latency_amplification: 10.0,
            neutral_stability: 80.0,
            peak_start_hour: 18,
            peak_end_hour: 23,
            peak_penalty: 20.0,
            peak_ratio: 1.5,
            peak_min_samples: 10,
            peak_recent_count: 3,
        }
    }
}

/// Per-component view of one score, kept for logging.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreBreakdown {
    pub latency: f64,
    pub load: f64,
    pub stability: f64,
    pub penalty: f64,
    pub score: f64,
    pub samples: usize,
}

/// Scores `node` from `samples` (newest first).
///
/// Returns `None` when there are no samples; the caller keeps the previous score.
pub fn score_node(
    node: &Node,
    samples: &[MetricSample],
    local_hour: u8,
    params: &ScoringParams,
) -> Option<ScoreBreakdown> {
    if samples.is_empty() {
        return None;
    }

    let latencies: Vec<f64> = samples.iter().filter_map(|s| s.latency_ms).collect();
    let losses: Vec<f64> = samples.iter().filter_map(|s| s.packet_loss).collect();

    let latency = match mean(&latencies) {
        Some(avg) => (100.0 / (avg + 1.0) * params.latency_amplification).clamp(0.0, 100.0),
        None => 0.0,
    };
    let load = (100.0 * (1.0 - node.load_factor)).max(0.0);
    let stability = match mean(&losses) {
        Some(loss) => (100.0 * (1.0 - loss)).max(0.0),
        None => params.neutral_stability,
    };

    let weighted = latency * params.latency_weight
        + load * params.load_weight
        + stability * params.stability_weight;

    let penalty = if is_peak_spike(&latencies, local_hour, params) {
        params.peak_penalty
    } else {
        0.0
    };

    let score = round2((weighted - penalty).clamp(0.0, 100.0));

    Some(ScoreBreakdown { latency, load, stability, penalty, score, samples: samples.len() })
}

fn is_peak_spike(latencies: &[f64], local_hour: u8, params: &ScoringParams) -> bool {
    if !(params.peak_start_hour..=params.peak_end_hour).contains(&local_hour) {
        return false;
    }
    if latencies.len() < params.peak_min_samples || params.peak_recent_count == 0 {
        return false;
    }
    let recent = &latencies[..params.peak_recent_count.min(latencies.len())];
    match (mean(recent), mean(latencies)) {
        (Some(recent_avg), Some(overall_avg)) => recent_avg > overall_avg * params.peak_ratio,
        _ => false,
    }
}

/// Current hour in the configured peak-hour zone.
///
/// With no fixed offset the host's local offset is used, falling back to UTC
/// when it cannot be determined.
pub fn local_hour(fixed_offset_hours: Option<i8>) -> u8 {
    let now = OffsetDateTime::now_utc();
    let offset = match fixed_offset_hours {
        Some(h) => UtcOffset::from_hms(h, 0, 0).unwrap_or(UtcOffset::UTC),
        None => UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC),
    };
    now.to_offset(offset).hour()
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
