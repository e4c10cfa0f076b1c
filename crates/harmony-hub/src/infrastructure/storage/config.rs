//! TOML configuration for discovery and hub sessions.
//!
//! Example file:
//!
//! ```toml
//! [discovery]
//! broadcast_address = "192.168.1.255"
//! interval_ms = 5000
//!
//! [session]
//! keepalive_ms = 5000
//! request_timeout_ms = 10000
//! ```
//!
//! Every field has a `#[serde(default = "...")]` so a partial file, or no file
//! at all, yields a working configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HarmonyConfig {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Broadcast and collection settings for the discovery engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryConfig {
    /// Destination of the announce datagram.
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: IpAddr,
    /// UDP port hubs listen on for announces.
    #[serde(default = "default_broadcast_port")]
    pub broadcast_port: u16,
    /// TCP port hubs connect back to with their self-report.  `0` lets the
    /// OS pick one; the announce carries the actual port.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Local address for both sockets.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Period between announces, in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// A hub unseen for `expiry_factor × interval` goes Offline.
    #[serde(default = "default_expiry_factor")]
    pub expiry_factor: u32,
    /// Upper bound on one self-report; longer reports are dropped.
    #[serde(default = "default_max_report_bytes")]
    pub max_report_bytes: usize,
}

/// Per-hub session settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Keepalive period in milliseconds; `0` disables it.
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_ms: u64,
    /// Optional timeout applied to every request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_broadcast_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::BROADCAST)
}
fn default_broadcast_port() -> u16 {
    5224
}
fn default_listen_port() -> u16 {
    61234
}
fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_interval_ms() -> u64 {
    5000
}
fn default_expiry_factor() -> u32 {
    2
}
fn default_max_report_bytes() -> usize {
    16 * 1024
}
fn default_keepalive_ms() -> u64 {
    5000
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            broadcast_address: default_broadcast_address(),
            broadcast_port: default_broadcast_port(),
            listen_port: default_listen_port(),
            bind_address: default_bind_address(),
            interval_ms: default_interval_ms(),
            expiry_factor: default_expiry_factor(),
            max_report_bytes: default_max_report_bytes(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_ms: default_keepalive_ms(),
            request_timeout_ms: None,
        }
    }
}

// ── Runtime conversions ───────────────────────────────────────────────────────

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    /// Age after which an Online hub is marked Offline.
    pub fn expiry_threshold(&self) -> Duration {
        self.interval() * self.expiry_factor.max(1)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.listen_port)
    }

    pub fn broadcast_target(&self) -> SocketAddr {
        SocketAddr::new(self.broadcast_address, self.broadcast_port)
    }
}

impl SessionConfig {
    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_ms > 0).then(|| Duration::from_millis(self.keepalive_ms))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Loads the configuration at `path`, returning defaults if the file does not
/// exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<HarmonyConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file absent, using defaults");
            Ok(HarmonyConfig::default())
        }
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &HarmonyConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
