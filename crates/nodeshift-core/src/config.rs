//! nodeshift.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeshiftConfig {
    pub cluster: Option<ClusterConfig>,
    pub orchestrator: Option<OrchestratorConfig>,
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
}

/// Identity of the cluster the pools belong to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub region: Option<String>,
    /// Name of a credentials profile handed to the node provisioner.
    pub credentials_profile: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub health_timeout: Option<String>,
    pub poll_interval: Option<String>,
    pub retry_limit: Option<u32>,
    pub retry_backoff: Option<String>,
    pub unhealthy_threshold: Option<u32>,
    pub ready_threshold: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
}

/// A node pool declared in the config file, registered on daemon start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub id: String,
    pub desired_count: u32,
    pub version: String,
    /// "surge" or "blue_green".
    pub strategy: Option<String>,
    pub max_surge: Option<u32>,
    pub max_unavailable: Option<u32>,
    pub batch_percentage: Option<u32>,
    pub soak: Option<String>,
}

/// Resolved orchestrator tunables with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// How long a new node may take to become Ready.
    pub health_timeout: Duration,
    /// Interval between readiness / soak probes.
    pub poll_interval: Duration,
    /// Creation retries per node before the operation fails.
    pub retry_limit: u32,
    /// Base backoff between creation retries (doubles, capped at 60s).
    pub retry_backoff: Duration,
    /// Consecutive unhealthy probes before a node is declared Unhealthy.
    pub unhealthy_threshold: u32,
    /// Consecutive ready probes before a node counts as Ready.
    pub ready_threshold: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            health_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(10),
            retry_limit: 3,
            retry_backoff: Duration::from_secs(5),
            unhealthy_threshold: 3,
            ready_threshold: 1,
        }
    }
}

pub const DEFAULT_PORT: u16 = 8443;
pub const DEFAULT_DATA_DIR: &str = "/var/lib/nodeshift";

impl NodeshiftConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: NodeshiftConfig = toml::from_str(content)?;
        // Resolve once so bad durations fail at load time, not mid-upgrade.
        config.orchestrator_settings()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Orchestrator tunables with defaults filled in.
    pub fn orchestrator_settings(&self) -> anyhow::Result<OrchestratorSettings> {
        let mut settings = OrchestratorSettings::default();
        let Some(cfg) = &self.orchestrator else {
            return Ok(settings);
        };

        if let Some(s) = &cfg.health_timeout {
            settings.health_timeout = duration_field("health_timeout", s)?;
        }
        if let Some(s) = &cfg.poll_interval {
            settings.poll_interval = duration_field("poll_interval", s)?;
            if settings.poll_interval.is_zero() {
                bail!("orchestrator.poll_interval must be greater than zero");
            }
        }
        if let Some(s) = &cfg.retry_backoff {
            settings.retry_backoff = duration_field("retry_backoff", s)?;
        }
        if let Some(n) = cfg.retry_limit {
            settings.retry_limit = n;
        }
        if let Some(n) = cfg.unhealthy_threshold {
            settings.unhealthy_threshold = n.max(1);
        }
        if let Some(n) = cfg.ready_threshold {
            settings.ready_threshold = n.max(1);
        }
        Ok(settings)
    }

    pub fn cluster_name(&self) -> &str {
        self.cluster.as_ref().map_or("default", |c| c.name.as_str())
    }

    pub fn port(&self) -> u16 {
        self.server
            .as_ref()
            .and_then(|s| s.port)
            .unwrap_or(DEFAULT_PORT)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.server
            .as_ref()
            .and_then(|s| s.data_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }
}

fn duration_field(name: &str, value: &str) -> anyhow::Result<Duration> {
    match parse_duration(value) {
        Some(d) => Ok(d),
        None => bail!("orchestrator.{name}: invalid duration {value:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = NodeshiftConfig::from_toml("").unwrap();
        assert_eq!(
            config.orchestrator_settings().unwrap(),
            OrchestratorSettings::default()
        );
        assert_eq!(config.port(), DEFAULT_PORT);
        assert_eq!(config.cluster_name(), "default");
        assert!(config.pools.is_empty());
    }

    #[test]
    fn parse_full() {
        let toml_str = r#"
[cluster]
name = "prod"
region = "eu-west-1"
credentials_profile = "ops"

[orchestrator]
health_timeout = "2m"
poll_interval = "500ms"
retry_limit = 5
retry_backoff = "1s"
unhealthy_threshold = 2

[server]
port = 9000
data_dir = "/tmp/nodeshift"

[[pools]]
id = "workers"
desired_count = 3
version = "1.29.0"
strategy = "blue_green"
batch_percentage = 50
soak = "5m"
"#;
        let config = NodeshiftConfig::from_toml(toml_str).unwrap();
        let settings = config.orchestrator_settings().unwrap();
        assert_eq!(settings.health_timeout, Duration::from_secs(120));
        assert_eq!(settings.poll_interval, Duration::from_millis(500));
        assert_eq!(settings.retry_limit, 5);
        assert_eq!(settings.unhealthy_threshold, 2);
        assert_eq!(settings.ready_threshold, 1);
        assert_eq!(config.cluster_name(), "prod");
        assert_eq!(config.port(), 9000);
        assert_eq!(config.data_dir(), PathBuf::from("/tmp/nodeshift"));
        assert_eq!(config.pools.len(), 1);
        assert_eq!(config.pools[0].strategy.as_deref(), Some("blue_green"));
    }

    #[test]
    fn bad_duration_is_rejected_at_load() {
        let toml_str = r#"
[orchestrator]
health_timeout = "whenever"
"#;
        let err = NodeshiftConfig::from_toml(toml_str).unwrap_err();
        assert!(err.to_string().contains("health_timeout"));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let toml_str = r#"
[orchestrator]
poll_interval = "0s"
"#;
        assert!(NodeshiftConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodeshift.toml");
        std::fs::write(&path, "[cluster]\nname = \"staging\"\n").unwrap();

        let config = NodeshiftConfig::from_file(&path).unwrap();
        assert_eq!(config.cluster_name(), "staging");
    }

    #[test]
    fn roundtrips_through_toml() {
        let config = NodeshiftConfig::from_toml("[server]\nport = 7000\n").unwrap();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("7000"));
    }
}
