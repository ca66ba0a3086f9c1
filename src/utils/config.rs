// src/utils/config.rs
//! Node configuration.
//!
//! Configuration is layered: built-in defaults, an optional config file,
//! then `AGORA__*` environment variables (e.g. `AGORA__RPC__CALL_TIMEOUT_SECS`).

use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::rpc::RpcClient;
use crate::utils::errors::Result;

/// Top-level node configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSettings,
    pub rpc: RpcSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSettings {
    /// Name used in logs for this node's environments
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcSettings {
    /// Timeout for establishing a connection to a peer
    pub connect_timeout_secs: u64,

    /// Timeout for a full call, response included
    pub call_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsSettings {
    /// `host:port` for the Prometheus exporter; disabled when unset
    #[serde(default)]
    pub listen: Option<String>,
}

impl NodeConfig {
    /// Load configuration from defaults, an optional file and environment
    /// variables
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("node.name", "agora")?
            .set_default("rpc.connect_timeout_secs", 5i64)?
            .set_default("rpc.call_timeout_secs", 300i64)?;

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        builder = builder.add_source(Environment::with_prefix("AGORA").separator("__"));

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// RPC client configured with this node's timeouts
    pub fn rpc_client(&self) -> RpcClient {
        RpcClient::new(
            Duration::from_secs(self.rpc.connect_timeout_secs),
            Duration::from_secs(self.rpc.call_timeout_secs),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::load(None).unwrap();
        assert_eq!(config.node.name, "agora");
        assert_eq!(config.rpc.connect_timeout_secs, 5);
        assert_eq!(config.rpc.call_timeout_secs, 300);
        assert!(config.metrics.listen.is_none());
    }

    #[test]
    fn test_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[node]\nname = \"testnode\"\n\n[rpc]\nconnect_timeout_secs = 1\n\n[metrics]\nlisten = \"127.0.0.1:9100\"\n"
        )
        .unwrap();

        let config = NodeConfig::load(path.to_str()).unwrap();
        assert_eq!(config.node.name, "testnode");
        assert_eq!(config.rpc.connect_timeout_secs, 1);
        // Untouched keys keep their defaults
        assert_eq!(config.rpc.call_timeout_secs, 300);
        assert_eq!(config.metrics.listen.as_deref(), Some("127.0.0.1:9100"));
    }
}
