//! Configuration for KivIO components
//!
//! One flat configuration struct shared by the masters, the nodes, and the
//! client. Binaries load it from a TOML file and override with CLI flags.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for KivIO
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Metadata store endpoints (etcd)
    pub meta_endpoints: Vec<String>,
    /// Address the cache master listens on
    pub cache_master_addr: String,
    /// Address reserved for the admin surface
    pub admin_addr: String,
    /// Metadata key holding the database node list
    pub db_nodes_key: String,
    /// Metadata key holding the cache node map
    pub cache_nodes_key: String,
    /// Metadata key prefix for raft-address -> http-address entries
    pub raft_key: String,
    /// Cache byte budget per cache node
    pub cache_bytes: u64,
    /// Overall per-request deadline (milliseconds)
    pub request_timeout_ms: u64,
    /// Latency threshold above which a successful response still demotes
    /// the fast endpoint (milliseconds)
    pub ideal_response_ms: u64,
    /// Period between client topology refreshes (milliseconds)
    pub meta_refresh_ms: u64,
    /// Period between master heartbeats (milliseconds)
    pub heartbeat_ms: u64,
    /// Shard count, reserved for the group router
    pub shard_count: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            meta_endpoints: vec!["localhost:2379".to_string()],
            cache_master_addr: ":5550".to_string(),
            admin_addr: ":5551".to_string(),
            db_nodes_key: "kivio.db.nodes".to_string(),
            cache_nodes_key: "kivio.cache.nodes".to_string(),
            raft_key: "kivio.db.node.raft".to_string(),
            cache_bytes: 1 << 20,
            request_timeout_ms: 100,
            ideal_response_ms: 50,
            meta_refresh_ms: 1000,
            heartbeat_ms: 1000,
            shard_count: 0,
        }
    }
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ideal_response(&self) -> Duration {
        Duration::from_millis(self.ideal_response_ms)
    }

    pub fn meta_refresh(&self) -> Duration {
        Duration::from_millis(self.meta_refresh_ms)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.db_nodes_key, "kivio.db.nodes");
        assert_eq!(config.request_timeout(), Duration::from_millis(100));
        assert_eq!(config.ideal_response(), Duration::from_millis(50));
        assert!(config.request_timeout() > config.ideal_response());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str("request_timeout_ms = 250").unwrap();
        assert_eq!(config.request_timeout(), Duration::from_millis(250));
        assert_eq!(config.cache_nodes_key, "kivio.cache.nodes");
    }
}
