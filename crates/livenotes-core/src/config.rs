//! Engine configuration
//!
//! Loaded from TOML; every field has a default so an empty or missing file
//! yields a working hub configuration. Durations are milliseconds.
//!
//! ```toml
//! role = "hub"
//! data_dir = ".livenotes"
//!
//! [server]
//! host = "192.168.10.161"
//! port = 8000
//! reconnect = { mode = "backoff", initial_ms = 1000, max_ms = 30000 }
//!
//! [radio]
//! payload_mode = "chunked"
//!
//! [fallback]
//! listen = "0.0.0.0:7878"
//! paired_peers = ["192.168.10.20:7878"]
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::sync::framing::{PayloadMode, DEFAULT_PAYLOAD_CEILING};
use crate::transport::{
    CentralTimings, FallbackOptions, PeripheralOptions, ReconnectPolicy, ServerEndpoint,
};

/// Which side of the radio link this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Holds the dataset, talks to the server, serves satellites
    #[default]
    Hub,
    /// Mirrors the hub's dataset and forwards local notes to it
    Satellite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub role: Role,
    /// Directory holding the snapshot cache
    pub data_dir: PathBuf,
    pub server: ServerConfig,
    pub radio: RadioConfig,
    pub fallback: FallbackConfig,
    pub sync: SyncConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            role: Role::Hub,
            data_dir: PathBuf::from(".livenotes"),
            server: ServerConfig::default(),
            radio: RadioConfig::default(),
            fallback: FallbackConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Connect to the server at all (hub only)
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub connect_timeout_ms: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let endpoint = ServerEndpoint::default();
        Self {
            enabled: true,
            host: endpoint.host,
            port: endpoint.port,
            path: endpoint.path,
            connect_timeout_ms: 5_000,
            reconnect: ReconnectPolicy::Manual,
        }
    }
}

impl ServerConfig {
    pub fn endpoint(&self) -> ServerEndpoint {
        ServerEndpoint {
            host: self.host.clone(),
            port: self.port,
            path: self.path.clone(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    pub scan_timeout_ms: u64,
    pub watchdog_timeout_ms: u64,
    pub scan_retry_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub request_state_delay_ms: u64,
    pub payload_ceiling: usize,
    pub payload_mode: PayloadMode,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 8_000,
            watchdog_timeout_ms: 8_000,
            scan_retry_ms: 3_000,
            reconnect_backoff_ms: 2_000,
            request_state_delay_ms: 500,
            payload_ceiling: DEFAULT_PAYLOAD_CEILING,
            payload_mode: PayloadMode::Truncate,
        }
    }
}

impl RadioConfig {
    pub fn central_timings(&self) -> CentralTimings {
        CentralTimings {
            scan_timeout: Duration::from_millis(self.scan_timeout_ms),
            watchdog_timeout: Duration::from_millis(self.watchdog_timeout_ms),
            scan_retry: Duration::from_millis(self.scan_retry_ms),
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_ms),
            request_state_delay: Duration::from_millis(self.request_state_delay_ms),
        }
    }

    pub fn peripheral_options(&self) -> PeripheralOptions {
        PeripheralOptions {
            payload_mode: self.payload_mode,
            payload_ceiling: self.payload_ceiling,
            retry_interval: Duration::from_millis(self.reconnect_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Hub listen address; `None` disables the hub-side fallback
    pub listen: Option<SocketAddr>,
    /// Satellite dial list, tried in order
    pub paired_peers: Vec<SocketAddr>,
    pub retry_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_line_length: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            listen: None,
            paired_peers: Vec::new(),
            retry_interval_ms: 10_000,
            connect_timeout_ms: 5_000,
            max_line_length: 1024 * 1024,
        }
    }
}

impl FallbackConfig {
    pub fn options(&self) -> FallbackOptions {
        FallbackOptions {
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            max_line_length: self.max_line_length,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Relay notes that did not come from the server up to the server
    pub relay_to_server: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            relay_to_server: true,
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file; a missing file gives the defaults
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => {
                debug!(path = %path.display(), "Loading config");
                Self::from_toml(&text)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(SyncError::Config(format!("{}: {}", path.display(), e))),
        }
    }

    pub fn from_toml(text: &str) -> SyncResult<Self> {
        toml::from_str(text).map_err(|e| SyncError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> SyncResult<String> {
        toml::to_string_pretty(self).map_err(|e| SyncError::Config(e.to_string()))
    }
}
