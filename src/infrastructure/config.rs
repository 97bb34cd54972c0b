//! Configuration management
//!
//! Loads configuration from config.toml at startup. Every section is
//! optional; missing values fall back to the venue defaults.

use crate::core::{EndpointError, EndpointType, EndpointUrls, GrvtEnv};
use crate::ws::ping::{
    KeepaliveConfig, DEFAULT_CLOSE_TIMEOUT, DEFAULT_PING_INTERVAL, DEFAULT_PING_TIMEOUT,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Crate configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Venue environment and endpoint URLs
    #[serde(default)]
    pub venue: VenueConfig,

    /// Keepalive tunables passed to every transport
    #[serde(default)]
    pub keepalive: KeepaliveSettings,

    /// Log files and filter
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Venue environment, with optional per-endpoint URL overrides
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct VenueConfig {
    #[serde(default)]
    pub env: GrvtEnv,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_data_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_data_rpc_full_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_data_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_data_rpc_full_url: Option<String>,
}

impl VenueConfig {
    /// Validated URL table for the configured environment
    pub fn endpoint_urls(&self) -> Result<EndpointUrls, EndpointError> {
        let overrides: HashMap<EndpointType, String> = [
            (EndpointType::MarketData, &self.market_data_url),
            (EndpointType::MarketDataRpcFull, &self.market_data_rpc_full_url),
            (EndpointType::TradeData, &self.trade_data_url),
            (EndpointType::TradeDataRpcFull, &self.trade_data_rpc_full_url),
        ]
        .into_iter()
        .filter_map(|(endpoint, url)| url.clone().map(|url| (endpoint, url)))
        .collect();

        EndpointUrls::with_overrides(self.env, &overrides)
    }
}

/// Keepalive tunables as written in config.toml (seconds)
///
/// Setting `ping_interval_secs` or `ping_timeout_secs` to 0 disables it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeepaliveSettings {
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: f64,

    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: f64,

    #[serde(default = "default_close_timeout")]
    pub close_timeout_secs: f64,

    /// Inbound frame queue capacity; unbounded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_queue: Option<usize>,

    /// Max message and frame size in bytes; unlimited when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<usize>,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            ping_timeout_secs: default_ping_timeout(),
            close_timeout_secs: default_close_timeout(),
            max_queue: None,
            max_size: None,
        }
    }
}

impl KeepaliveSettings {
    /// Convert into the transport keepalive bundle
    ///
    /// # Errors
    /// Returns error if a timing value exceeds `MAX_KEEPALIVE_SECS`.
    pub fn to_keepalive(&self) -> Result<KeepaliveConfig, ConfigError> {
        Ok(KeepaliveConfig {
            ping_interval: keepalive_secs("ping_interval_secs", self.ping_interval_secs)?,
            ping_timeout: keepalive_secs("ping_timeout_secs", self.ping_timeout_secs)?,
            close_timeout: keepalive_secs("close_timeout_secs", self.close_timeout_secs)?
                .unwrap_or(DEFAULT_CLOSE_TIMEOUT),
            max_queue: self.max_queue,
            max_size: self.max_size,
        })
    }
}

/// Upper bound for any keepalive timing value (one day)
pub const MAX_KEEPALIVE_SECS: f64 = 86_400.0;

/// `None` for zero, negative or NaN values; error above the bound
fn keepalive_secs(field: &'static str, secs: f64) -> Result<Option<Duration>, ConfigError> {
    if secs > MAX_KEEPALIVE_SECS {
        return Err(ConfigError::OutOfRange { field, value: secs });
    }
    if secs > 0.0 {
        Ok(Some(Duration::from_secs_f64(secs)))
    } else {
        Ok(None)
    }
}

/// Log output configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Directory for rolling log files
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,

    /// EnvFilter directive, overridden by RUST_LOG
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Also log to stdout
    #[serde(default = "default_console")]
    pub console: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            filter: default_log_filter(),
            console: default_console(),
        }
    }
}

fn default_ping_interval() -> f64 {
    DEFAULT_PING_INTERVAL.as_secs_f64()
}

fn default_ping_timeout() -> f64 {
    DEFAULT_PING_TIMEOUT.as_secs_f64()
}

fn default_close_timeout() -> f64 {
    DEFAULT_CLOSE_TIMEOUT.as_secs_f64()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_console() -> bool {
    true
}

impl Config {
    /// Load configuration from config.toml (or `CONFIG_PATH`)
    ///
    /// If the file doesn't exist, returns default configuration.
    /// # Errors
    /// Returns error if file exists but cannot be read or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => Self::from_toml(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(ConfigError::IoError(e)),
        }
    }

    /// Parse configuration from a TOML string
    ///
    /// Keepalive values are range-checked here so a bad file fails at load.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.keepalive.to_keepalive()?;
        Ok(config)
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO error reading file
    #[error("Failed to read config file: {0}")]
    IoError(#[source] std::io::Error),
    /// Parse error (invalid TOML)
    #[error("Failed to parse config: {0}")]
    ParseError(String),
    /// Value outside the accepted range
    #[error("{field} = {value} is out of range (max 86400 seconds)")]
    OutOfRange { field: &'static str, value: f64 },
}
