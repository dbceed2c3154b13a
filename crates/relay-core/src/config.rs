//! Configuration loading

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::discovery::DiscoveryConfig;
use crate::logging::LogConfig;

/// Top-level configuration for a relay node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub logging: LogConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub node: NodeConfig,
}

/// Settings for the node's own listening endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Peer id of this node (a random id is generated when unset)
    #[serde(default)]
    pub id: Option<String>,

    /// Address the listening endpoint binds to (default: 0.0.0.0)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Listening port (default: 8082)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Pending-connection queue length (default: 5)
    #[serde(default = "default_backlog")]
    pub backlog: i32,

    /// Clients accepted per accept round (default: 5)
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Peers idle for longer than this are pruned (default: 5 minutes)
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,

    /// How often the pruning sweep runs (default: 30 seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl NodeConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            listen_address: default_listen_address(),
            port: default_port(),
            backlog: default_backlog(),
            max_clients: default_max_clients(),
            inactivity_timeout_secs: default_inactivity_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_backlog() -> i32 {
    5
}

fn default_max_clients() -> usize {
    5
}

fn default_inactivity_timeout() -> u64 {
    300 // 5 minutes
}

fn default_sweep_interval() -> u64 {
    30
}

impl RelayConfig {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: RelayConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogLevel;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.discovery.group, "239.255.0.1");
        assert_eq!(config.discovery.port, 5353);
        assert_eq!(config.discovery.bind_address, "0.0.0.0");
        assert_eq!(config.discovery.probe_interval(), Duration::from_secs(5));
        assert_eq!(config.discovery.receive_timeout(), Duration::from_secs(1));
        assert_eq!(config.node.listen_address, "0.0.0.0");
        assert_eq!(config.node.port, 8082);
        assert_eq!(config.node.backlog, 5);
        assert!(config.node.id.is_none());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = RelayConfig::load(dir.path().join("relay.json")).unwrap();
        assert_eq!(config.node.port, 8082);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(
            &path,
            r#"{
                "logging": { "level": "DEBUG" },
                "discovery": { "port": 6000 },
                "node": { "id": "alpha", "port": 9000 }
            }"#,
        )
        .unwrap();

        let config = RelayConfig::load(&path).unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.discovery.port, 6000);
        assert_eq!(config.discovery.group, "239.255.0.1");
        assert_eq!(config.node.id.as_deref(), Some("alpha"));
        assert_eq!(config.node.port, 9000);
        assert_eq!(config.node.backlog, 5);
        assert_eq!(config.node.inactivity_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = RelayConfig::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse"));
    }
}
