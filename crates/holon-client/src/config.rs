//! Client configuration.
//!
//! Constructible in code with defaults, or loaded from a TOML document:
//!
//! ```toml
//! schema_version = 1
//!
//! [server]
//! url = "ws://127.0.0.1:8080/rpc"
//!
//! [heartbeat]
//! interval_ms = 15000
//! timeout_ms = 5000
//!
//! [reconnect]
//! min_delay_ms = 250
//! max_delay_ms = 30000
//! factor = 2.0
//! jitter = 0.1
//!
//! [invoke]
//! connect_timeout_ms = 10000
//! request_timeout_ms = 30000
//! ```
//!
//! # Required fields
//! - `schema_version = 1`
//! - `server.url`
//!
//! Everything else defaults.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Tunables for one peer client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub reconnect_min_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_factor: f64,
    pub reconnect_jitter: f64,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 5_000,
            reconnect_min_delay_ms: 250,
            reconnect_max_delay_ms: 30_000,
            reconnect_factor: 2.0,
            reconnect_jitter: 0.1,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl ClientConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// A loaded config file: the broker URL plus the tunables.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub url: String,
    pub config: ClientConfig,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (Option for every optional field)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    server: Option<RawServer>,
    heartbeat: Option<RawHeartbeat>,
    reconnect: Option<RawReconnect>,
    invoke: Option<RawInvoke>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawHeartbeat {
    interval_ms: Option<u64>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawReconnect {
    min_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    factor: Option<f64>,
    jitter: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawInvoke {
    connect_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_settings_from_path(path: &Path) -> Result<ClientSettings, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_settings_from_str(&toml_str)
}

pub fn load_settings_from_str(toml_str: &str) -> Result<ClientSettings, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let raw_server = raw
        .server
        .ok_or_else(|| ConfigError::MissingField("server".to_owned()))?;
    let url = raw_server
        .url
        .ok_or_else(|| ConfigError::MissingField("server.url".to_owned()))?;

    let defaults = ClientConfig::default();
    let mut config = defaults.clone();

    if let Some(hb) = raw.heartbeat {
        config.heartbeat_interval_ms = hb.interval_ms.unwrap_or(defaults.heartbeat_interval_ms);
        config.heartbeat_timeout_ms = hb.timeout_ms.unwrap_or(defaults.heartbeat_timeout_ms);
    }
    if let Some(rc) = raw.reconnect {
        config.reconnect_min_delay_ms = rc.min_delay_ms.unwrap_or(defaults.reconnect_min_delay_ms);
        config.reconnect_max_delay_ms = rc.max_delay_ms.unwrap_or(defaults.reconnect_max_delay_ms);
        config.reconnect_factor = rc.factor.unwrap_or(defaults.reconnect_factor);
        config.reconnect_jitter = rc.jitter.unwrap_or(defaults.reconnect_jitter);
    }
    if let Some(inv) = raw.invoke {
        config.connect_timeout_ms = inv
            .connect_timeout_ms
            .unwrap_or(defaults.connect_timeout_ms);
        config.request_timeout_ms = inv
            .request_timeout_ms
            .unwrap_or(defaults.request_timeout_ms);
    }

    validate(&config)?;
    Ok(ClientSettings { url, config })
}

fn validate(config: &ClientConfig) -> Result<(), ConfigError> {
    if config.heartbeat_interval_ms == 0 || config.heartbeat_timeout_ms == 0 {
        return Err(ConfigError::InvalidValue(
            "heartbeat intervals must be positive".to_owned(),
        ));
    }
    if config.reconnect_min_delay_ms == 0
        || config.reconnect_max_delay_ms < config.reconnect_min_delay_ms
    {
        return Err(ConfigError::InvalidValue(
            "reconnect delays must be positive with max >= min".to_owned(),
        ));
    }
    if config.reconnect_factor < 1.0 {
        return Err(ConfigError::InvalidValue(format!(
            "reconnect.factor must be >= 1.0, got {}",
            config.reconnect_factor
        )));
    }
    if !(0.0..1.0).contains(&config.reconnect_jitter) {
        return Err(ConfigError::InvalidValue(format!(
            "reconnect.jitter must be in [0, 1), got {}",
            config.reconnect_jitter
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
