//! Configuration management for ptymux.
//!
//! Configuration is read from a TOML file, by default
//! `~/.config/ptymux/config.toml`. Every section falls back to defaults for
//! missing keys, and a handful of environment variables override the file.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ptymux_protocol::DEFAULT_MAX_FRAME_SIZE;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest accepted `max_frame_size`.
pub const MIN_FRAME_SIZE: usize = 64;

/// Largest accepted `max_frame_size`.
pub const MAX_FRAME_SIZE_LIMIT: usize = 64 * 1024 * 1024;

/// Largest accepted `max_sessions`.
pub const MAX_SESSIONS_LIMIT: usize = 10_000;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_frame_size must be between 64 and 67108864, got {0}")]
    InvalidMaxFrameSize(usize),

    #[error("read_buffer_size must be greater than 0")]
    InvalidReadBufferSize,

    #[error("listen must be a socket address such as 127.0.0.1:7681, got {0}")]
    InvalidListenAddress(String),

    #[error("max_sessions must be between 1 and 10000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Transport and framing settings.
    pub connection: ConnectionConfig,

    /// Session limits.
    pub session: SessionConfig,

    /// Logging.
    pub log: LogConfig,
}

/// Transport and framing settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Largest accepted frame body, in bytes.
    pub max_frame_size: usize,

    /// Size of each transport read.
    pub read_buffer_size: usize,

    /// Address `ptymux serve` binds to.
    pub listen: String,
}

/// Session limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of concurrently registered sessions per connection.
    pub max_sessions: usize,

    /// Output scrollback kept per session, in bytes. 0 disables it.
    pub history_bytes: usize,
}

/// Logging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buffer_size: 8 * 1024,
            listen: "127.0.0.1:7681".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            history_bytes: 1024 * 1024, // 1 MiB
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ptymux")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported variables:
    /// - PTYMUX_LOG_LEVEL: override log level
    /// - PTYMUX_LISTEN: override the listen address
    /// - PTYMUX_MAX_FRAME_SIZE: override the frame size limit (bytes)
    ///
    /// Empty values are ignored, as is an unparsable frame size.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("PTYMUX_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.log.level = level;
            }
        }

        if let Ok(listen) = std::env::var("PTYMUX_LISTEN") {
            if !listen.is_empty() {
                tracing::info!("Overriding listen address from environment: {}", listen);
                self.connection.listen = listen;
            }
        }

        if let Ok(size) = std::env::var("PTYMUX_MAX_FRAME_SIZE") {
            match size.trim().parse::<usize>() {
                Ok(size) => {
                    tracing::info!("Overriding max_frame_size from environment: {}", size);
                    self.connection.max_frame_size = size;
                }
                Err(_) if size.is_empty() => {}
                Err(e) => {
                    tracing::warn!(value = %size, error = %e, "Ignoring PTYMUX_MAX_FRAME_SIZE");
                }
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let frame = self.connection.max_frame_size;
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE_LIMIT).contains(&frame) {
            return Err(ConfigError::InvalidMaxFrameSize(frame));
        }

        if self.connection.read_buffer_size == 0 {
            return Err(ConfigError::InvalidReadBufferSize);
        }

        if self.connection.listen.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddress(
                self.connection.listen.clone(),
            ));
        }

        let sessions = self.session.max_sessions;
        if !(1..=MAX_SESSIONS_LIMIT).contains(&sessions) {
            return Err(ConfigError::InvalidMaxSessions(sessions));
        }

        let level = self.log.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
        }

        Ok(())
    }

    /// The validated listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.connection
            .listen
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddress(self.connection.listen.clone()))
    }

    /// Load configuration from a file.
    ///
    /// A missing file yields the default configuration.
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
