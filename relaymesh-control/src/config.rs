use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, path::PathBuf};
use tokio::fs;

use crate::error::{ControlError, Result};
use crate::scoring::ScoringParams;
use crate::selection::SelectionWeights;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ControlConfig {
    pub bind: String,
    pub db_path: PathBuf,
    pub scheduler: SchedulerConf,
    pub retention: RetentionConf,
    pub scoring: ScoringParams,
    pub selection: SelectionWeights,
    /// Deployment-wide node secret, used when a node has none of its own
    pub node_secret: Option<String>,
    /// Required on admin routes (x-api-key)
    pub api_key: Option<String>,
    /// A node without heartbeat for this long is reported stale
    pub heartbeat_timeout_secs: u64,
    /// Fixed UTC offset for the peak-hour window; None = host local time
    pub peak_utc_offset_hours: Option<i8>,
    /// Nodes upserted at startup
    pub nodes: HashMap<String, NodeConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConf {
    pub enabled: bool,
    pub interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RetentionConf {
    /// Samples considered by a scoring pass
    pub window_minutes: u64,
    /// Samples older than this are deleted by the sweeper
    pub keep_hours: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NodeConf {
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub load_factor: f64,
    #[serde(default)]
    pub secret: Option<String>,
}

fn default_protocol() -> String {
    "vless".into()
}

fn default_true() -> bool {
    true
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".into(),
            db_path: PathBuf::from("./data/relaymesh.db"),
            scheduler: SchedulerConf::default(),
            retention: RetentionConf::default(),
            scoring: ScoringParams::default(),
            selection: SelectionWeights::default(),
            node_secret: None,
            api_key: None,
            heartbeat_timeout_secs: 300,
            peak_utc_offset_hours: None,
            nodes: HashMap::new(),
        }
    }
}

impl Default for SchedulerConf {
    fn default() -> Self {
        Self { enabled: true, interval_secs: 60 }
    }
}

impl Default for RetentionConf {
    fn default() -> Self {
        Self { window_minutes: 5, keep_hours: 24, sweep_interval_secs: 600 }
    }
}

impl ControlConfig {
    /// Environment overrides, applied on top of the YAML file
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RELAYMESH_BIND") {
            self.bind = v;
        }
        if let Some(v) = lookup("RELAYMESH_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SCHEDULER_INTERVAL_SECONDS") {
            self.scheduler.interval_secs = parse_env("SCHEDULER_INTERVAL_SECONDS", &v)?;
        }
        if let Some(v) = lookup("SCHEDULER_ENABLED") {
            self.scheduler.enabled = parse_bool("SCHEDULER_ENABLED", &v)?;
        }
        if let Some(v) = lookup("NODE_COMMUNICATION_KEY") {
            self.node_secret = Some(v);
        }
        if let Some(v) = lookup("RELAYMESH_API_KEY") {
            self.api_key = Some(v);
        }
        if let Some(v) = lookup("NODE_HEARTBEAT_TIMEOUT_SECONDS") {
            self.heartbeat_timeout_secs = parse_env("NODE_HEARTBEAT_TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = lookup("METRICS_WINDOW_MINUTES") {
            self.retention.window_minutes = parse_env("METRICS_WINDOW_MINUTES", &v)?;
        }
        if let Some(v) = lookup("METRICS_RETENTION_HOURS") {
            self.retention.keep_hours = parse_env("METRICS_RETENTION_HOURS", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.interval_secs == 0 {
            return Err(ControlError::Config("scheduler.interval_secs must be > 0".into()));
        }
        if self.retention.window_minutes == 0 {
            return Err(ControlError::Config("retention.window_minutes must be > 0".into()));
        }
        if self.retention.keep_hours * 60 < self.retention.window_minutes {
            return Err(ControlError::Config(
                "retention.keep_hours must cover the scoring window".into(),
            ));
        }
        let weights = [self.selection.latency, self.selection.load, self.selection.random];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ControlError::Config(
                "selection weights must be finite and >= 0".into(),
            ));
        }
        if self.selection.total() <= 0.0 {
            return Err(ControlError::Config("selection weights must sum to > 0".into()));
        }
        for (id, node) in &self.nodes {
            if !(0.0..=1.0).contains(&node.load_factor) {
                return Err(ControlError::Config(format!(
                    "node {id}: load_factor must be within [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ControlError::Config(format!("{key}: invalid value '{value}'")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ControlError::Config(format!("{key}: invalid boolean '{value}'"))),
    }
}

/// Reads the YAML file from `path`; a missing or empty file yields the defaults.
pub async fn load_config_from(path: &Path) -> Result<ControlConfig> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "no control config file, using defaults");
        return Ok(ControlConfig::default());
    }
    let txt = fs::read_to_string(path).await?;
    if txt.trim().is_empty() {
        return Ok(ControlConfig::default());
    }
    serde_yaml::from_str(&txt)
        .map_err(|e| ControlError::Config(format!("{}: {e}", path.display())))
}

pub async fn load_config() -> Result<ControlConfig> {
    let path = std::env::var("RELAYMESH_CONTROL_CONFIG").unwrap_or_else(|_| "control.yaml".into());
    let mut cfg = load_config_from(Path::new(&path)).await?;
    cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let cfg = load_config_from(Path::new("/nonexistent/control.yaml")).await.unwrap();
        assert_eq!(cfg.scheduler.interval_secs, 60);
        assert!(cfg.scheduler.enabled);
        assert_eq!(cfg.retention.window_minutes, 5);
    }

    #[tokio::test]
    async fn test_yaml_nodes_and_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "scheduler:\n  interval_secs: 30\nnodes:\n  hk-01:\n    name: HK-01\n    address: 10.0.0.1\n    port: 443\n    load_factor: 0.25\n"
        )
        .unwrap();

        let cfg = load_config_from(file.path()).await.unwrap();
        assert_eq!(cfg.scheduler.interval_secs, 30);
        assert!(cfg.scheduler.enabled);
        let node = &cfg.nodes["hk-01"];
        assert_eq!(node.protocol, "vless");
        assert!(node.active);
        assert!((node.load_factor - 0.25).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_invalid_yaml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "scheduler: [not, a, map]").unwrap();
        assert!(load_config_from(file.path()).await.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = ControlConfig::default();
        cfg.apply_env_overrides(|key| match key {
            "SCHEDULER_INTERVAL_SECONDS" => Some("15".into()),
            "SCHEDULER_ENABLED" => Some("false".into()),
            "NODE_COMMUNICATION_KEY" => Some("shared".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.scheduler.interval_secs, 15);
        assert!(!cfg.scheduler.enabled);
        assert_eq!(cfg.node_secret.as_deref(), Some("shared"));

        let bad = cfg.apply_env_overrides(|key| {
            (key == "SCHEDULER_ENABLED").then(|| "maybe".to_string())
        });
        assert!(bad.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_selection_weights() {
        let mut cfg = ControlConfig::default();
        cfg.selection.latency = 1.0;
        cfg.selection.load = 1.0;
        cfg.selection.random = -1.0;
        assert!(cfg.validate().is_err());

        cfg.selection.random = f64::NAN;
        assert!(cfg.validate().is_err());

        cfg.selection.random = 0.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut cfg = ControlConfig::default();
        cfg.scheduler.interval_secs = 0;
        assert!(cfg.validate().is_err());
    }
}
