//! Node configuration.
//!
//! Every protocol constant is carried by [`NodeConfig`] so deployments can
//! tune them from a TOML file and tests can shrink the timeouts to
//! milliseconds. The defaults are the standard Kademlia parameters.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DhtError, Result};

/// Complete configuration of a Weft node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address to bind the UDP socket on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// UDP port; 0 = OS-assigned ephemeral port.
    #[serde(default)]
    pub listen_port: u16,
    /// Bucket size and replication factor.
    #[serde(default = "default_k")]
    pub k: usize,
    /// Lookup parallelism factor.
    #[serde(default = "default_alpha")]
    pub alpha: usize,
    /// Per-request RPC timeout in milliseconds.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Delay between lookup iterations in milliseconds.
    /// Unset = two thirds of the RPC timeout.
    #[serde(default)]
    pub iterative_lookup_delay_ms: Option<u64>,
    /// A bucket not used for this long is refreshed, in milliseconds.
    #[serde(default = "default_refresh_timeout_ms")]
    pub refresh_timeout_ms: u64,
    /// Interval between refresh checks in milliseconds.
    #[serde(default = "default_check_refresh_interval_ms")]
    pub check_refresh_interval_ms: u64,
    /// Stored-item lifetime in milliseconds.
    #[serde(default = "default_data_expire_timeout_ms")]
    pub data_expire_timeout_ms: u64,
    /// Replication re-push interval in milliseconds.
    #[serde(default = "default_replicate_interval_ms")]
    pub replicate_interval_ms: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_k() -> usize {
    crate::K
}

fn default_alpha() -> usize {
    crate::ALPHA
}

fn default_rpc_timeout_ms() -> u64 {
    crate::RPC_TIMEOUT_MS
}

fn default_refresh_timeout_ms() -> u64 {
    crate::REFRESH_TIMEOUT_MS
}

fn default_check_refresh_interval_ms() -> u64 {
    crate::CHECK_REFRESH_INTERVAL_MS
}

fn default_data_expire_timeout_ms() -> u64 {
    crate::DATA_EXPIRE_TIMEOUT_MS
}

fn default_replicate_interval_ms() -> u64 {
    crate::REPLICATE_INTERVAL_MS
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: 0,
            k: default_k(),
            alpha: default_alpha(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            iterative_lookup_delay_ms: None,
            refresh_timeout_ms: default_refresh_timeout_ms(),
            check_refresh_interval_ms: default_check_refresh_interval_ms(),
            data_expire_timeout_ms: default_data_expire_timeout_ms(),
            replicate_interval_ms: default_replicate_interval_ms(),
        }
    }
}

impl NodeConfig {
    /// Load a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| DhtError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| DhtError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(DhtError::Config("k must be at least 1".to_string()));
        }
        if self.alpha == 0 {
            return Err(DhtError::Config("alpha must be at least 1".to_string()));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(DhtError::Config(
                "rpc_timeout_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// The socket address to bind.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let ip = self
            .listen_addr
            .parse()
            .map_err(|e| DhtError::Config(format!("bad listen_addr {:?}: {e}", self.listen_addr)))?;
        Ok(SocketAddr::new(ip, self.listen_port))
    }

    /// Per-request RPC timeout.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Delay between lookup iterations; defaults to ⅔ of the RPC timeout.
    pub fn lookup_delay(&self) -> Duration {
        Duration::from_millis(
            self.iterative_lookup_delay_ms
                .unwrap_or(self.rpc_timeout_ms * 2 / 3),
        )
    }

    /// Bucket refresh timeout.
    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    /// Interval between refresh checks.
    pub fn check_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.check_refresh_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.k, 8);
        assert_eq!(config.alpha, 3);
        assert_eq!(config.rpc_timeout(), Duration::from_secs(20));
        assert_eq!(config.lookup_delay(), Duration::from_millis(20_000 * 2 / 3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_lookup_delay_wins() {
        let config = NodeConfig {
            iterative_lookup_delay_ms: Some(50),
            ..Default::default()
        };
        assert_eq!(config.lookup_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_toml_roundtrip_with_partial_input() {
        let config: NodeConfig =
            toml::from_str("listen_port = 4100\nk = 16\n").expect("parse config");
        assert_eq!(config.listen_port, 4100);
        assert_eq!(config.k, 16);
        assert_eq!(config.alpha, crate::ALPHA);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = NodeConfig {
            k: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = NodeConfig {
            listen_addr: "not-an-ip".to_string(),
            ..Default::default()
        };
        assert!(config.bind_addr().is_err());
    }
}
