//! Configuration management for SessionMux.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/sessionmux/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::manager::ManagerOptions;
use crate::transport::websocket::DEFAULT_ENDPOINT;
use crate::transport::WebSocketConfig;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("endpoint must start with ws:// or wss://, got {0}")]
    InvalidEndpoint(String),

    #[error("base_url must start with http:// or https://, got {0}")]
    InvalidBaseUrl(String),

    #[error("scope_id must not be empty")]
    EmptyScope,

    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: u64,
        max: u64,
        value: u64,
    },

    #[error("max_backoff_ms ({max}) must not be lower than initial_backoff_ms ({initial})")]
    InvalidBackoff { initial: u64, max: u64 },

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Streaming link settings.
    pub transport: TransportConfig,

    /// Persistence API settings.
    pub persistence: PersistenceConfig,

    /// Session manager tuning.
    pub manager: ManagerConfig,

    /// Log output.
    pub logging: LoggingConfig,
}

/// Streaming link configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// WebSocket endpoint of the streaming server.
    pub endpoint: String,

    /// Handshake timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Interval between keep-alive pings in seconds.
    pub heartbeat_interval_secs: u64,

    /// Reconnect after the link drops.
    pub auto_reconnect: bool,

    /// First reconnect delay in milliseconds.
    pub initial_backoff_ms: u64,

    /// Upper bound for the reconnect delay in milliseconds.
    pub max_backoff_ms: u64,
}

/// Persistence API configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Base URL of the REST API.
    pub base_url: String,

    /// Scope (workspace) whose sessions are listed.
    pub scope_id: String,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

/// Manager tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManagerConfig {
    /// Seconds without a heartbeat before a connected session is dead.
    pub heartbeat_timeout_secs: u64,

    /// Seconds between liveness sweeps.
    pub liveness_sweep_secs: u64,

    /// Capacity of each per-session control queue.
    pub control_queue_capacity: usize,

    /// Capacity of the change broadcast channel.
    pub broadcast_capacity: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional log file. Logs go to stderr when unset.
    pub log_file: Option<PathBuf>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            connect_timeout_secs: 10,
            heartbeat_interval_secs: 15,
            auto_reconnect: true,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787/api".to_string(),
            scope_id: "default".to_string(),
            request_timeout_secs: 10,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let options = ManagerOptions::default();
        Self {
            heartbeat_timeout_secs: options.heartbeat_timeout.as_secs(),
            liveness_sweep_secs: options.liveness_sweep_interval.as_secs(),
            control_queue_capacity: options.control_queue_capacity,
            broadcast_capacity: options.broadcast_capacity,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sessionmux")
        .join("config.toml")
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            min,
            max,
            value,
        });
    }
    Ok(())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SESSIONMUX_ENDPOINT: Override the streaming endpoint
    /// - SESSIONMUX_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var("SESSIONMUX_ENDPOINT") {
            if !endpoint.is_empty() {
                tracing::info!("Overriding endpoint from environment: {}", endpoint);
                self.transport.endpoint = endpoint;
            }
        }

        if let Ok(level) = std::env::var("SESSIONMUX_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.logging.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoint = &self.transport.endpoint;
        if !endpoint.starts_with("ws://") && !endpoint.starts_with("wss://") {
            return Err(ConfigError::InvalidEndpoint(endpoint.clone()));
        }
        check_range("connect_timeout_secs", self.transport.connect_timeout_secs, 1, 300)?;
        check_range(
            "heartbeat_interval_secs",
            self.transport.heartbeat_interval_secs,
            1,
            3600,
        )?;
        check_range("initial_backoff_ms", self.transport.initial_backoff_ms, 1, 600_000)?;
        if self.transport.max_backoff_ms < self.transport.initial_backoff_ms {
            return Err(ConfigError::InvalidBackoff {
                initial: self.transport.initial_backoff_ms,
                max: self.transport.max_backoff_ms,
            });
        }

        let base_url = &self.persistence.base_url;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::InvalidBaseUrl(base_url.clone()));
        }
        if self.persistence.scope_id.trim().is_empty() {
            return Err(ConfigError::EmptyScope);
        }
        check_range(
            "request_timeout_secs",
            self.persistence.request_timeout_secs,
            1,
            300,
        )?;

        check_range("heartbeat_timeout_secs", self.manager.heartbeat_timeout_secs, 1, 3600)?;
        check_range("liveness_sweep_secs", self.manager.liveness_sweep_secs, 1, 3600)?;
        check_range(
            "control_queue_capacity",
            self.manager.control_queue_capacity as u64,
            1,
            65_536,
        )?;
        check_range(
            "broadcast_capacity",
            self.manager.broadcast_capacity as u64,
            1,
            65_536,
        )?;

        let level = self.logging.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.log_level.clone()));
        }

        Ok(())
    }

    /// Streaming link settings for [`crate::transport::WebSocketTransport`].
    pub fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::new(self.transport.endpoint.clone())
            .with_auto_reconnect(self.transport.auto_reconnect)
            .with_initial_backoff(Duration::from_millis(self.transport.initial_backoff_ms))
            .with_max_backoff(Duration::from_millis(self.transport.max_backoff_ms))
            .with_heartbeat_interval(Duration::from_secs(self.transport.heartbeat_interval_secs));
        config.connect_timeout = Duration::from_secs(self.transport.connect_timeout_secs);
        config
    }

    /// Manager tuning for [`crate::SessionStreamManager`].
    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            heartbeat_timeout: Duration::from_secs(self.manager.heartbeat_timeout_secs),
            liveness_sweep_interval: Duration::from_secs(self.manager.liveness_sweep_secs),
            control_queue_capacity: self.manager.control_queue_capacity,
            broadcast_capacity: self.manager.broadcast_capacity,
        }
    }

    /// Per-request timeout for the persistence client.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.persistence.request_timeout_secs)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
