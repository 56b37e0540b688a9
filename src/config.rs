//! Daemon configuration.
//!
//! Layered loading, lowest priority first: built-in defaults, an optional
//! config file under the user config directory, then `SPEGEL_*` environment
//! variables.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::throttle::Byterate;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpegelConfig {
    /// Registry listen address
    pub registry_addr: String,
    /// DHT listen address
    pub router_addr: String,
    /// Metrics listen address
    pub metrics_addr: String,
    /// Address clients use to reach this node's registry
    pub local_addr: String,
    /// OCI image layout directory of the local content store
    pub data_dir: PathBuf,
    /// Containerd registry configuration directory
    pub containerd_config_path: PathBuf,
    /// Upstream registries to mirror
    pub registries: Vec<String>,
    /// Multiaddress of an existing peer, empty for the first node
    pub bootstrap_peer: Option<String>,
    /// Empty resolve rounds to attempt before giving up
    pub resolve_retries: usize,
    /// Peer discovery budget in milliseconds
    pub resolve_timeout_ms: u64,
    /// Serve references with the `latest` tag
    pub resolve_latest_tag: bool,
    /// Pace blob writes at this rate
    pub blob_speed: Option<Byterate>,
    /// Seconds between advertisement refreshes, must stay below the 10
    /// minute record TTL
    pub refresh_period_secs: u64,
}

impl Default for SpegelConfig {
    fn default() -> Self {
        Self {
            registry_addr: "0.0.0.0:5000".to_owned(),
            router_addr: "0.0.0.0:5001".to_owned(),
            metrics_addr: "127.0.0.1:9090".to_owned(),
            local_addr: String::new(),
            data_dir: PathBuf::from("/var/lib/spegel"),
            containerd_config_path: PathBuf::from("/etc/containerd/certs.d"),
            registries: vec!["https://docker.io".to_owned()],
            bootstrap_peer: None,
            resolve_retries: 3,
            resolve_timeout_ms: 1_000,
            resolve_latest_tag: true,
            blob_speed: None,
            refresh_period_secs: 300,
        }
    }
}

impl SpegelConfig {
    fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("spegel"))
            .ok_or_else(|| Error::other("Unable to determine config directory"))
    }

    /// Create a configuration builder with the standard priority stack:
    /// defaults, then an optional config file, then `SPEGEL_*` environment
    /// variables.
    pub fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        let config_file = Self::config_dir()?.join("spegeld");
        Ok(config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(config_file).required(false))
            .add_source(
                config::Environment::with_prefix("SPEGEL")
                    .separator("__")
                    .list_separator(","),
            ))
    }

    /// Load configuration with the standard priority stack.
    pub fn load() -> Result<Self> {
        Ok(Self::builder()?.build()?.try_deserialize()?)
    }

    pub fn resolve_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn refresh_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.refresh_period_secs)
    }
}
