//! Configuration shared by both proxy sides
//!
//! Each side keeps its own TOML file under the user config directory
//! (`usb-relay/physical.toml`, `usb-relay/gadget.toml`); both embed a
//! `[transport]` table described by [`TransportConfig`].

use anyhow::{Context, Result, anyhow};
use protocol::{HEADER_SIZE, MAX_MESSAGE_SIZE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

/// Port the physical side sends to
pub const PHYSICAL_PEER_PORT: u16 = 64240;

/// Port the gadget side listens on
pub const GADGET_LISTEN_PORT: u16 = 64241;

/// Address of the relay host in the default deployment
pub const DEFAULT_PEER_HOST: Ipv4Addr = Ipv4Addr::new(192, 168, 64, 1);

/// Receive buffer size used when none is configured; fits any encodable message
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = MAX_MESSAGE_SIZE;

/// Datagram transport settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Local address to bind
    #[serde(default = "TransportConfig::default_bind")]
    pub bind: SocketAddr,
    /// Fixed peer address; when absent the last sender heard from is used
    #[serde(default)]
    pub peer: Option<SocketAddr>,
    /// Largest datagram accepted
    #[serde(default = "TransportConfig::default_max_datagram_size")]
    pub max_datagram_size: usize,
}

impl TransportConfig {
    /// Defaults for the side attached to the real device
    pub fn physical_default() -> Self {
        Self {
            bind: Self::default_bind(),
            peer: Some(SocketAddr::new(IpAddr::V4(DEFAULT_PEER_HOST), PHYSICAL_PEER_PORT)),
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        }
    }

    /// Defaults for the side impersonating the device
    pub fn gadget_default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), GADGET_LISTEN_PORT),
            peer: None,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        }
    }

    fn default_bind() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }

    fn default_max_datagram_size() -> usize {
        DEFAULT_MAX_DATAGRAM_SIZE
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.max_datagram_size < HEADER_SIZE || self.max_datagram_size > MAX_MESSAGE_SIZE {
            return Err(anyhow!(
                "Invalid max_datagram_size {}, must be between {} and {}",
                self.max_datagram_size,
                HEADER_SIZE,
                MAX_MESSAGE_SIZE
            ));
        }
        if let Some(peer) = self.peer
            && peer.port() == 0
        {
            return Err(anyhow!("Invalid peer address '{}', port must not be 0", peer));
        }
        Ok(())
    }
}

/// Validate a tracing log level name
pub fn validate_log_level(level: &str) -> Result<()> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&level) {
        return Err(anyhow!(
            "Invalid log level '{}', must be one of: {}",
            level,
            valid_levels.join(", ")
        ));
    }
    Ok(())
}

/// Default location of a config file inside the usb-relay config directory
pub fn default_config_path(file_name: &str) -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        config_dir.join("usb-relay").join(file_name)
    } else {
        PathBuf::from(".config/usb-relay").join(file_name)
    }
}

/// Expand `~` in a user-supplied path
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

/// Read and parse a TOML file
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Serialize to TOML, creating parent directories as needed
pub fn save_toml<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(value).context("Failed to serialize configuration")?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create config directory: {}", parent.display())
        })?;
    }

    fs::write(path, content)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;

    tracing::info!("Saved configuration to: {}", path.display());
    Ok(())
}
