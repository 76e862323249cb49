//! Gadget-side configuration

use anyhow::{Result, anyhow};
use common::TransportConfig;
use common::config::{default_config_path, load_toml, save_toml, validate_log_level};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GadgetConfig {
    #[serde(default = "GadgetConfig::default_log_level")]
    pub log_level: String,
    #[serde(default = "TransportConfig::gadget_default")]
    pub transport: TransportConfig,
}

impl Default for GadgetConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            transport: TransportConfig::gadget_default(),
        }
    }
}

impl GadgetConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Load configuration from the specified path, or the first existing default location
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => [
                Self::default_path(),
                PathBuf::from("/etc/usb-relay/gadget.toml"),
            ]
            .into_iter()
            .find(|p| p.exists())
            .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?,
        };

        let config: GadgetConfig = load_toml(&config_path)?;
        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    pub fn load_or_default() -> Self {
        Self::load(None).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config: {}, using defaults", e);
            Self::default()
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_toml(self, path)
    }

    pub fn default_path() -> PathBuf {
        default_config_path("gadget.toml")
    }

    pub fn validate(&self) -> Result<()> {
        validate_log_level(&self.log_level)?;
        self.transport.validate()
    }
}
