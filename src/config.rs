//! Node configuration.
//!
//! Loaded from an optional YAML file; every field has a default so a bare
//! `todoq` starts a standalone node. CLI flags override the file values
//! for the handful of options that differ per process in local clusters.

use std::path::Path;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub node: NodeConfig,
    pub cluster: ClusterConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    pub serf: SerfConfig,
    pub http: HttpConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SerfConfig {
    pub bind_addr: String,
    pub advertise_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub seeds: Vec<String>,
    pub encrypt_key: Option<String>,
    /// Seconds to wait for the initial join.
    pub join_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            node: NodeConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "node-1".to_string(),
            serf: SerfConfig::default(),
            http: HttpConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Default for SerfConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7946".to_string(),
            advertise_addr: None,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./todos.db".to_string(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            encrypt_key: None,
            join_timeout: 10,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Default tracing filter derived from `log_level`.
    pub fn log_filter(&self) -> &str {
        match self.log_level.to_lowercase().as_str() {
            "debug" => "debug",
            "warn" | "warning" => "warn",
            "error" => "error",
            "trace" => "trace",
            _ => "info",
        }
    }

    /// Decodes `cluster.encrypt_key` into the 32-byte gossip key.
    pub fn gossip_key(&self) -> anyhow::Result<Option<[u8; 32]>> {
        let Some(encoded) = &self.cluster.encrypt_key else {
            return Ok(None);
        };
        let bytes = BASE64
            .decode(encoded)
            .context("cluster.encrypt_key is not valid base64")?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("cluster.encrypt_key must decode to exactly 32 bytes"))?;
        Ok(Some(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.node.name, "node-1");
        assert_eq!(config.node.serf.bind_addr, "0.0.0.0:7946");
        assert_eq!(config.node.http.port, 8080);
        assert_eq!(config.node.database.path, "./todos.db");
        assert!(config.cluster.seeds.is_empty());
        assert_eq!(config.cluster.join_timeout, 10);
    }

    #[test]
    fn test_parse_partial_yaml_keeps_defaults() {
        let yaml = "
log_level: debug
node:
  name: node-2
  http:
    port: 9090
cluster:
  seeds:
    - \"127.0.0.1:7946\"
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.node.name, "node-2");
        assert_eq!(config.node.http.port, 9090);
        // Unspecified sections fall back to defaults.
        assert_eq!(config.node.serf.bind_addr, "0.0.0.0:7946");
        assert_eq!(config.node.database.path, "./todos.db");
        assert_eq!(config.cluster.seeds, vec!["127.0.0.1:7946".to_string()]);
        assert_eq!(config.cluster.join_timeout, 10);
    }

    #[test]
    fn test_gossip_key_roundtrip() {
        use base64::{engine::general_purpose::STANDARD, Engine as _};

        let mut config = Config::default();
        assert!(config.gossip_key().unwrap().is_none());

        config.cluster.encrypt_key = Some(STANDARD.encode([7u8; 32]));
        assert_eq!(config.gossip_key().unwrap(), Some([7u8; 32]));

        config.cluster.encrypt_key = Some(STANDARD.encode([1u8; 16]));
        assert!(config.gossip_key().is_err());

        config.cluster.encrypt_key = Some("not base64!!".to_string());
        assert!(config.gossip_key().is_err());
    }
}
