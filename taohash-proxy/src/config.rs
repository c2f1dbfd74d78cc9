use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use taohash_stratum::PoolDescriptor;

/// Default listener port for the normal pool
pub const DEFAULT_PROXY_PORT: u16 = 3331;

/// Default listener port for the high-difficulty pool
pub const DEFAULT_PROXY_PORT_HIGH: u16 = 3332;

/// Default dashboard port
pub const DEFAULT_DASHBOARD_PORT: u16 = 8100;

/// Default internal reload API address
pub const DEFAULT_RELOAD_ADDR: &str = "127.0.0.1:5010";

/// Proxy configuration: upstream pool descriptors keyed by label
/// (`normal`, `high_diff`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProxyConfig {
    pub pools: BTreeMap<String, PoolDescriptor>,
}

impl ProxyConfig {
    /// Load and validate the TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: ProxyConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;

        if config.pools.is_empty() {
            bail!("configuration must have a non-empty 'pools' section");
        }

        Ok(config)
    }
}

/// TCP ports the proxy listens on, one per pool label.
#[derive(Debug, Clone, Copy)]
pub struct ListenPorts {
    pub normal: u16,
    pub high_diff: u16,
}

impl Default for ListenPorts {
    fn default() -> Self {
        Self {
            normal: DEFAULT_PROXY_PORT,
            high_diff: DEFAULT_PROXY_PORT_HIGH,
        }
    }
}

impl ListenPorts {
    /// Port bound for a pool label. Unknown labels share the normal port.
    pub fn for_label(&self, label: &str) -> u16 {
        match label {
            "high_diff" => self.high_diff,
            _ => self.normal,
        }
    }
}
