//! Configuration loading

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use mesh_core::{ReconnectConfig, TimekeepConfig};
use serde::Deserialize;

use crate::manager::ManagerConfig;
use crate::peer::LivenessConfig;

/// Daemon configuration, read from `config.json`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeshConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub join: JoinConfig,
    pub timing: TimekeepConfig,
    pub liveness: LivenessConfig,
    pub reconnect: ReconnectConfig,
    pub rpc_timeout_ms: u64,
    pub rendezvous_poll_ms: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            network: NetworkConfig::default(),
            join: JoinConfig::default(),
            timing: TimekeepConfig::default(),
            liveness: LivenessConfig::default(),
            reconnect: ReconnectConfig::default(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            rendezvous_poll_ms: default_rendezvous_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Persistent node uuid; a fresh one is generated when absent
    #[serde(default)]
    pub uuid: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            uuid: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// WebSocket transport bind address
    #[serde(default = "default_listen")]
    pub listen: String,
    /// URL other nodes dial, defaults to `ws://<listen>`
    #[serde(default)]
    pub advertise: Option<String>,
    /// HTTP signaling bind address
    #[serde(default = "default_http")]
    pub http: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            advertise: None,
            http: default_http(),
        }
    }
}

/// Nodes to join at startup
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinConfig {
    #[serde(default)]
    pub http: Vec<String>,
    #[serde(default)]
    pub rendezvous: Vec<RendezvousTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RendezvousTarget {
    pub host: String,
    pub peer_uuid: String,
}

fn default_name() -> String {
    "mesh-node".to_string()
}

fn default_listen() -> String {
    "0.0.0.0:6513".to_string()
}

fn default_http() -> String {
    "0.0.0.0:6512".to_string()
}

fn default_rpc_timeout_ms() -> u64 {
    5000
}

fn default_rendezvous_poll_ms() -> u64 {
    1000
}

impl MeshConfig {
    /// Load `config.json` from `config_dir`, or defaults when it does not exist.
    pub fn load(config_dir: &str) -> Result<Self> {
        let config_file = Path::new(config_dir).join("config.json");

        if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config = Self::from_json(&content)?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_file
            );
            Ok(Self::default())
        }
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).with_context(|| "Failed to parse config.json")
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            liveness: self.liveness.clone(),
            timekeep: self.timing.clone(),
            reconnect: self.reconnect.clone(),
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
            rendezvous_poll_interval: Duration::from_millis(self.rendezvous_poll_ms),
            ..ManagerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = MeshConfig::from_json("{}").unwrap();
        assert_eq!(config.identity.name, "mesh-node");
        assert_eq!(config.network.listen, "0.0.0.0:6513");
        assert_eq!(config.network.http, "0.0.0.0:6512");
        assert_eq!(config.rpc_timeout_ms, 5000);
        assert!(config.join.http.is_empty());
        assert_eq!(config.reconnect, ReconnectConfig::default());
    }

    #[test]
    fn test_partial_sections() {
        let config = MeshConfig::from_json(
            r#"{
                "identity": {"name": "kitchen"},
                "join": {
                    "http": ["http://10.0.0.2:6512"],
                    "rendezvous": [{"host": "https://rdv.example", "peerUuid": "abc"}]
                },
                "liveness": {"timeout": 3000},
                "rpcTimeoutMs": 250
            }"#,
        )
        .unwrap();

        assert_eq!(config.identity.name, "kitchen");
        assert!(config.identity.uuid.is_none());
        assert_eq!(config.join.http, vec!["http://10.0.0.2:6512"]);
        assert_eq!(config.join.rendezvous[0].peer_uuid, "abc");
        assert_eq!(config.liveness.timeout, Duration::from_secs(3));
        assert_eq!(config.liveness.ping_interval, Duration::from_secs(2));

        let manager = config.manager_config();
        assert_eq!(manager.rpc_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(MeshConfig::from_json("{not json").is_err());
    }
}
