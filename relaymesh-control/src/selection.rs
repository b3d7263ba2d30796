//! Node ranking for client-facing selection.
//!
//! Two orderings are offered: plain `ai_score` descending, and a load-spread
//! ranking that mixes normalized latency, normalized load and a random term so
//! clients do not all pile onto the single best node.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use time::OffsetDateTime;

use crate::models::Node;

/// Weights of the jittered ranking. Normalized to sum 1 before use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionWeights {
    pub latency: f64,
    pub load: f64,
    pub random: f64,
}

impl Default for SelectionWeights {
    fn default() -> Self {
        Self { latency: 0.5, load: 0.3, random: 0.2 }
    }
}

impl SelectionWeights {
    pub fn total(&self) -> f64 {
        self.latency + self.load + self.random
    }

    fn normalized(&self) -> Self {
        let total = self.total();
        if total <= 0.0 {
            return Self::default();
        }
        Self {
            latency: self.latency / total,
            load: self.load / total,
            random: self.random / total,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedNode {
    pub rank: usize,
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub protocol: String,
    pub ai_score: f64,
    pub load_factor: f64,
    pub latency_ms: Option<f64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_heartbeat_at: Option<OffsetDateTime>,
    pub stale: bool,
    /// Present only for the jittered ranking
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_score: Option<f64>,
}

/// Min-max normalization to [0, 1].
///
/// A single value, or a set where every value is equal, maps to 0.5.
pub fn normalize(values: &[f64]) -> Vec<f64> {
    let Some(min) = values.iter().copied().reduce(f64::min) else {
        return Vec::new();
    };
    let max = values.iter().copied().fold(min, f64::max);
    let span = max - min;
    if span <= 0.0 || !span.is_finite() {
        return vec![0.5; values.len()];
    }
    values.iter().map(|v| (v - min) / span).collect()
}

/// Context shared by both rankings.
pub struct RankInput<'a> {
    pub nodes: Vec<Node>,
    pub latencies: &'a HashMap<String, f64>,
    pub now: OffsetDateTime,
    pub heartbeat_timeout: time::Duration,
}

impl RankInput<'_> {
    fn entry(&self, node: &Node, selection_score: Option<f64>) -> RankedNode {
        let stale = match node.last_heartbeat_at {
            Some(at) => self.now - at > self.heartbeat_timeout,
            None => true,
        };
        RankedNode {
            rank: 0,
            id: node.id.clone(),
            name: node.name.clone(),
            address: node.address.clone(),
            port: node.port,
            protocol: node.protocol.clone(),
            ai_score: node.ai_score,
            load_factor: node.load_factor,
            latency_ms: self.latencies.get(&node.id).copied(),
            last_heartbeat_at: node.last_heartbeat_at,
            stale,
            selection_score,
        }
    }
}

/// Orders nodes by `ai_score` descending, ties broken by id.
pub fn rank_by_score(input: &RankInput<'_>) -> Vec<RankedNode> {
    let mut nodes: Vec<&Node> = input.nodes.iter().collect();
    nodes.sort_by(|a, b| {
        b.ai_score
            .partial_cmp(&a.ai_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    assign_ranks(nodes.into_iter().map(|n| input.entry(n, None)).collect())
}

/// Load-spread ranking with a random component drawn from `rng`.
///
/// Nodes with no latency in the window are treated as the slowest of the set.
pub fn rank_with_jitter<R: Rng>(
    input: &RankInput<'_>,
    weights: &SelectionWeights,
    rng: &mut R,
) -> Vec<RankedNode> {
    if input.nodes.is_empty() {
        return Vec::new();
    }
    let w = weights.normalized();

    let worst = input
        .nodes
        .iter()
        .filter_map(|n| input.latencies.get(&n.id).copied())
        .reduce(f64::max)
        .unwrap_or(0.0);
    let latencies: Vec<f64> = input
        .nodes
        .iter()
        .map(|n| input.latencies.get(&n.id).copied().unwrap_or(worst))
        .collect();
    let loads: Vec<f64> = input.nodes.iter().map(|n| n.load_factor).collect();

    let norm_latency = normalize(&latencies);
    let norm_load = normalize(&loads);

    let mut scored: Vec<(f64, &Node)> = input
        .nodes
        .iter()
        .enumerate()
        .map(|(i, node)| {
            let raw = (1.0 - norm_latency[i]) * w.latency
                + (1.0 - norm_load[i]) * w.load
                + rng.random::<f64>() * w.random;
            ((raw * 10_000.0).round() / 10_000.0, node)
        })
        .collect();

    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.1.id.cmp(&b.1.id))
    });

    assign_ranks(
        scored
            .into_iter()
            .map(|(score, node)| input.entry(node, Some(score)))
            .collect(),
    )
}

fn assign_ranks(mut ranked: Vec<RankedNode>) -> Vec<RankedNode> {
    for (i, entry) in ranked.iter_mut().enumerate() {
        entry.rank = i + 1;
    }
    ranked
}
