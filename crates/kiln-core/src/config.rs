//! kiln.toml configuration parser.
//!
//! Every field is optional; the daemon fills gaps from its command line
//! flags and built-in defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KilnConfig {
    pub server: Option<ServerConfig>,
    pub engine: Option<EngineConfig>,
    pub discovery: Option<DiscoveryConfig>,
    pub downscale: Option<DownscaleConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: Option<u16>,
    pub temp_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Statically configured engine, e.g. `tcp://buildkitd:1234`.
    pub address: Option<String>,
    pub disable_cache: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub enabled: Option<bool>,
    pub pod_selector: Option<String>,
    pub namespace: Option<String>,
    pub lease_prefix: Option<String>,
    pub statefulset: Option<String>,
    pub port: Option<u16>,
    pub scaling_disabled: Option<bool>,
    pub use_tenant_namespace: Option<bool>,
    pub set_tenant_labels: Option<bool>,
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownscaleConfig {
    pub enabled: Option<bool>,
    pub grace_period: Option<String>,
    pub interval: Option<String>,
}

impl KilnConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// Parse a duration like `500ms`, `30s`, `5m`, `2h`, `1h 30m`, or bare
/// seconds.
pub fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    let s = s.trim();
    match s.parse::<u64>() {
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(_) => humantime::parse_duration(s),
    }
}
