//! # Machine connection and streaming configuration
//!
//! Loaded from a TOML file. Every section and field is optional; missing
//! values fall back to the defaults below.
//!
//! ## Example
//!
//! ```toml
//! [connection]
//! kind = "serial"
//! device = "/dev/ttyUSB0"
//! baud = 115200
//!
//! [streaming]
//! ack_window = 10
//! exec_window = 10
//!
//! [polling]
//! status_interval_ms = 70
//!
//! [reconnect]
//! max_attempts = 5
//!
//! [offsets]
//! active = "G55"
//!
//! [offsets.slots]
//! G55 = [10.0, 20.0, -5.0]
//! ```
//!
//! ```rust
//! use millstream::config::{Config, ConnectionKind};
//! let config: Config = toml::from_str("[connection]\nkind = \"socket\"\nhost = \"10.0.0.7\"").unwrap();
//! assert_eq!(config.connection.kind, ConnectionKind::Socket);
//! assert_eq!(config.connection.port, 23);
//! assert_eq!(config.streaming.ack_window, 10);
//! assert!(config.validate().is_ok());
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use millstream_shared::{OffsetId, OffsetTable, Point};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub offsets: OffsetsConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    #[default]
    Serial,
    Socket,
    Simulated,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub kind: ConnectionKind,
    /// Serial device path.
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            kind: ConnectionKind::default(),
            device: None,
            baud: default_baud(),
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Flow-control tunables. The two windows bound lines in flight: unacknowledged
/// lines, and lines sent ahead of the one the controller reports executing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamingConfig {
    #[serde(default = "default_window")]
    pub ack_window: usize,
    #[serde(default = "default_window")]
    pub exec_window: usize,
    /// Drop a bare `ok` that directly follows a status telegram.
    #[serde(default = "default_true")]
    pub coalesce_status_ok: bool,
    /// Delay between the feed hold and the soft reset after a controller error.
    #[serde(default = "default_reset_delay_ms")]
    pub reset_delay_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            ack_window: default_window(),
            exec_window: default_window(),
            coalesce_status_ok: default_true(),
            reset_delay_ms: default_reset_delay_ms(),
        }
    }
}

impl StreamingConfig {
    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollingConfig {
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
    #[serde(default = "default_modal_interval_ms")]
    pub modal_interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            status_interval_ms: default_status_interval_ms(),
            modal_interval_ms: default_modal_interval_ms(),
        }
    }
}

impl PollingConfig {
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn modal_interval(&self) -> Duration {
        Duration::from_millis(self.modal_interval_ms)
    }
}

/// Socket reconnection backoff. Serial connections never reconnect on their own.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_true(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OffsetsConfig {
    /// Work offset assumed active before the first program line.
    #[serde(default = "default_active_offset")]
    pub active: String,
    /// Initial slot values keyed by code (`G54`..`G59`, `G92`).
    #[serde(default)]
    pub slots: BTreeMap<String, [f64; 3]>,
}

impl Default for OffsetsConfig {
    fn default() -> Self {
        Self { active: default_active_offset(), slots: BTreeMap::new() }
    }
}

impl OffsetsConfig {
    pub fn active_offset(&self) -> Result<OffsetId, ConfigError> {
        OffsetId::from_code(&self.active.to_ascii_uppercase())
            .filter(|id| id.is_work_offset())
            .ok_or_else(|| ConfigError::Invalid(format!("unknown active work offset '{}'", self.active)))
    }

    pub fn table(&self) -> Result<OffsetTable, ConfigError> {
        let mut table = OffsetTable::new();
        for (code, [x, y, z]) in &self.slots {
            let id = OffsetId::from_code(&code.to_ascii_uppercase())
                .ok_or_else(|| ConfigError::Invalid(format!("unknown offset slot '{code}'")))?;
            table.set(id, Point::new(*x, *y, *z));
        }
        Ok(table)
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.streaming.ack_window == 0 || self.streaming.exec_window == 0 {
            return Err(ConfigError::Invalid("streaming windows must be > 0".to_string()));
        }
        if self.polling.status_interval_ms == 0 || self.polling.modal_interval_ms == 0 {
            return Err(ConfigError::Invalid("polling intervals must be > 0".to_string()));
        }
        match self.connection.kind {
            ConnectionKind::Serial if self.connection.device.as_deref().unwrap_or("").is_empty() => {
                return Err(ConfigError::Invalid("serial connection requires a device".to_string()));
            }
            ConnectionKind::Socket if self.connection.host.is_empty() => {
                return Err(ConfigError::Invalid("socket connection requires a host".to_string()));
            }
            _ => {}
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::Invalid("reconnect base_delay_ms exceeds max_delay_ms".to_string()));
        }
        self.offsets.active_offset()?;
        self.offsets.table()?;
        Ok(())
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file '{}': {}", path.display(), e);
        ConfigError::Io(e)
    })?;
    let config: Config = toml::from_str(&contents).map_err(|e| {
        tracing::error!("Failed to parse config TOML: {}", e);
        ConfigError::Toml(e)
    })?;
    config.validate()?;
    Ok(config)
}

fn default_baud() -> u32 { 115_200 }
fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 23 }
fn default_window() -> usize { 10 }
fn default_true() -> bool { true }
fn default_reset_delay_ms() -> u64 { 250 }
fn default_status_interval_ms() -> u64 { 70 }
fn default_modal_interval_ms() -> u64 { 1000 }
fn default_max_attempts() -> u32 { 5 }
fn default_base_delay_ms() -> u64 { 500 }
fn default_max_delay_ms() -> u64 { 8000 }
fn default_active_offset() -> String { "G54".to_string() }
