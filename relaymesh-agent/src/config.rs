//! Agent configuration
//!
//! Sources, lowest to highest priority:
//! - Built-in defaults
//! - TOML file (`$RELAYMESH_AGENT_CONFIG` or `<config dir>/relaymesh-agent/config.toml`)
//! - Environment variables

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Full heartbeat endpoint URL
    pub ingest_url: String,
    pub node_id: String,
    pub node_name: String,
    #[serde(skip_serializing)]
    pub node_secret: Option<String>,
    pub report_interval_secs: u64,
    pub ping_targets: Vec<String>,
    pub ping_timeout_secs: u64,
    pub ping_count: u32,
    pub http_timeout_secs: u64,
    /// Attempts per heartbeat, including the first
    pub push_attempts: u32,
    pub retry_backoff_ms: u64,
    pub max_consecutive_failures: u32,
    /// CPU utilization sampling window
    pub cpu_sample_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            ingest_url: "http://localhost:8000/api/v1/node/heartbeat".to_string(),
            node_id: String::new(),
            node_name: gethostname::gethostname().to_string_lossy().to_string(),
            node_secret: None,
            report_interval_secs: 10,
            ping_targets: vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()],
            ping_timeout_secs: 2,
            ping_count: 1,
            http_timeout_secs: 5,
            push_attempts: 3,
            retry_backoff_ms: 1000,
            max_consecutive_failures: 5,
            cpu_sample_ms: 1000,
        }
    }
}

impl AgentConfig {
    /// Load file + environment and validate
    pub async fn load() -> Result<Self> {
        let path = match std::env::var("RELAYMESH_AGENT_CONFIG") {
            Ok(p) => PathBuf::from(p),
            Err(_) => Self::config_file_path()?,
        };
        let mut config = Self::load_from(&path).await?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Missing file = defaults
    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("relaymesh-agent");
        path.push("config.toml");
        Ok(path)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RELAYMESH_INGEST_URL") {
            self.ingest_url = v;
        }
        if let Some(v) = lookup("NODE_ID") {
            self.node_id = v;
        }
        if let Some(v) = lookup("NODE_NAME") {
            self.node_name = v;
        }
        if let Some(v) = lookup("NODE_SECRET") {
            self.node_secret = (!v.is_empty()).then_some(v);
        }
        if let Some(v) = lookup("REPORT_INTERVAL") {
            self.report_interval_secs = v.trim().parse().context("REPORT_INTERVAL")?;
        }
        if let Some(v) = lookup("PING_TARGETS") {
            self.ping_targets = v
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("HTTP_TIMEOUT") {
            self.http_timeout_secs = v.trim().parse().context("HTTP_TIMEOUT")?;
        }
        if let Some(v) = lookup("MAX_CONSECUTIVE_FAILURES") {
            self.max_consecutive_failures = v.trim().parse().context("MAX_CONSECUTIVE_FAILURES")?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            bail!("NODE_ID is required");
        }
        if !(self.ingest_url.starts_with("http://") || self.ingest_url.starts_with("https://")) {
            bail!("ingest_url must be an http(s) URL: {}", self.ingest_url);
        }
        if self.report_interval_secs == 0 {
            bail!("report interval must be > 0");
        }
        if self.max_consecutive_failures == 0 {
            bail!("max_consecutive_failures must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_toml_then_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "node_id = \"hk-01\"\nreport_interval_secs = 30\nping_targets = [\"9.9.9.9\"]"
        )
        .unwrap();

        let mut config = AgentConfig::load_from(file.path()).await.unwrap();
        assert_eq!(config.node_id, "hk-01");
        assert_eq!(config.report_interval_secs, 30);
        assert_eq!(config.http_timeout_secs, 5);

        config
            .apply_env_overrides(|key| match key {
                "REPORT_INTERVAL" => Some("15".into()),
                "PING_TARGETS" => Some("8.8.8.8, 1.1.1.1,".into()),
                "NODE_SECRET" => Some("abc".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.report_interval_secs, 15);
        assert_eq!(config.ping_targets, vec!["8.8.8.8", "1.1.1.1"]);
        assert_eq!(config.node_secret.as_deref(), Some("abc"));
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_missing_file_defaults() {
        let config = AgentConfig::load_from(Path::new("/nonexistent/agent.toml")).await.unwrap();
        assert_eq!(config.report_interval_secs, 10);
        assert_eq!(config.max_consecutive_failures, 5);
        assert_eq!(config.ping_targets.len(), 2);
    }

    #[test]
    fn test_validate_requires_node_id() {
        assert!(AgentConfig::default().validate().is_err());
    }

    #[test]
    fn test_bad_number_is_error() {
        let mut config = AgentConfig::default();
        let result = config.apply_env_overrides(|key| {
            (key == "REPORT_INTERVAL").then(|| "ten".to_string())
        });
        assert!(result.is_err());
    }
}
