//! Physical-side configuration management

use anyhow::{Result, anyhow};
use common::config::{default_config_path, load_toml, save_toml, validate_log_level};
use common::TransportConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalConfig {
    #[serde(default = "PhysicalConfig::default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default = "TransportConfig::physical_default")]
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Device to relay as `VID:PID` (e.g. "0x1234:0x5678" or "0x1234:*");
    /// the first non-hub device when absent
    #[serde(default)]
    pub device: Option<String>,
}

impl Default for PhysicalConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            usb: UsbSettings::default(),
            transport: TransportConfig::physical_default(),
        }
    }
}

impl PhysicalConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-relay/physical.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let config: PhysicalConfig = load_toml(&config_path)?;
        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_toml(self, path)
    }

    pub fn default_path() -> PathBuf {
        default_config_path("physical.toml")
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        validate_log_level(&self.log_level)?;
        if let Some(filter) = &self.usb.device {
            validate_filter(filter)?;
        }
        self.transport.validate()
    }
}

/// Validate a USB device filter pattern (VID:PID)
pub fn validate_filter(filter: &str) -> Result<()> {
    let parts: Vec<&str> = filter.split(':').collect();
    if parts.len() != 2 {
        return Err(anyhow!(
            "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
            filter
        ));
    }

    let (vid, pid) = (parts[0], parts[1]);
    if vid != "*" {
        validate_hex_id(vid, "VID")?;
    }
    if pid != "*" {
        validate_hex_id(pid, "PID")?;
    }
    Ok(())
}

fn validate_hex_id(id: &str, name: &str) -> Result<()> {
    let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
        return Err(anyhow!(
            "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
            name,
            id
        ));
    };

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;
    Ok(())
}

/// Whether a VID/PID pair matches a validated filter
pub fn filter_matches(filter: &str, vid: u16, pid: u16) -> bool {
    let Some((filter_vid, filter_pid)) = filter.split_once(':') else {
        return false;
    };
    id_matches(filter_vid, vid) && id_matches(filter_pid, pid)
}

fn id_matches(pattern: &str, id: u16) -> bool {
    if pattern == "*" {
        return true;
    }
    let hex = pattern.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(hex, 16).is_ok_and(|v| v == id)
}
