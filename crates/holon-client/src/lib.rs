//! Holon-RPC peer client: a long-lived broker connection with heartbeats
//! and exponential-backoff reconnect.

pub mod client;
pub mod config;

pub use client::{ClientError, HolonClient};
pub use config::{
    ClientConfig, ClientSettings, ConfigError, load_settings_from_path, load_settings_from_str,
};
