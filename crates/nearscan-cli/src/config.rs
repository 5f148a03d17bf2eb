//! Configuration loading

use anyhow::Result;
use nearscan_discovery::{BleConfig, BleEmitMode, LanSweepConfig};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub lan: LanConfig,
    #[serde(default)]
    pub ble: BleSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanConfig {
    /// Subnet to sweep
    #[serde(default = "default_subnet")]
    pub subnet: Ipv4Addr,
    /// Subnet prefix length
    #[serde(default = "default_prefix")]
    pub prefix_len: u8,
    /// Probes in flight at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Per-host probe timeout
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            subnet: default_subnet(),
            prefix_len: default_prefix(),
            concurrency: default_concurrency(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

fn default_subnet() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 1, 0)
}

fn default_prefix() -> u8 {
    24
}

fn default_concurrency() -> usize {
    64
}

fn default_probe_timeout_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BleSettings {
    /// Stop after this many seconds; 0 scans until interrupted
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Progress tick period while a window is set
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Re-publish every known peripheral on each sighting
    #[serde(default)]
    pub full_refresh: bool,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            progress_interval_ms: default_progress_interval_ms(),
            full_refresh: false,
        }
    }
}

fn default_window_secs() -> u64 {
    10
}

fn default_progress_interval_ms() -> u64 {
    1000
}

impl Config {
    pub fn to_lan_config(&self) -> LanSweepConfig {
        LanSweepConfig {
            subnet: self.lan.subnet,
            prefix_len: self.lan.prefix_len,
            concurrency: self.lan.concurrency,
            probe_timeout: Duration::from_millis(self.lan.probe_timeout_ms),
        }
    }

    pub fn to_ble_config(&self) -> BleConfig {
        BleConfig {
            emit_mode: if self.ble.full_refresh {
                BleEmitMode::FullRefresh
            } else {
                BleEmitMode::Incremental
            },
            scan_window: (self.ble.window_secs > 0)
                .then(|| Duration::from_secs(self.ble.window_secs)),
            progress_interval: Duration::from_millis(self.ble.progress_interval_ms),
        }
    }
}

/// Load configuration from file, falling back to defaults when it is missing
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(&Config::default())?;
    std::fs::write(path, content)?;
    Ok(())
}
