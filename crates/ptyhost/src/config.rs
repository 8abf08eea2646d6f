//! Configuration management for ptyhost.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/ptyhost/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use protocol::messages::{DEFAULT_COLS, DEFAULT_ROWS};

/// Environment variable overriding the log level.
pub const ENV_LOG_LEVEL: &str = "PTYHOST_LOG_LEVEL";

/// Environment variable forcing pipe emulation (`1`, `true` or `yes`).
pub const ENV_FORCE_PIPE: &str = "PTYHOST_FORCE_PIPE";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("default terminal size must be non-zero, got {cols}x{rows}")]
    InvalidGeometry { cols: u16, rows: u16 },

    #[error("kick_delay_ms must be at most 10000, got {0}")]
    InvalidKickDelay(u64),

    #[error("drain_grace_ms must be at most 60000, got {0}")]
    InvalidDrainGrace(u64),

    #[error("cleanup_interval_secs must be between 1 and 3600, got {0}")]
    InvalidCleanupInterval(u64),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Process-wide settings.
    pub daemon: DaemonConfig,

    /// Session settings.
    pub session: SessionConfig,
}

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Write logs to this file instead of stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell used when a session is created without a command.
    pub default_shell: String,

    /// Columns used when the caller gives no geometry.
    pub default_cols: u16,

    /// Rows used when the caller gives no geometry.
    pub default_rows: u16,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Never use a PTY, even when one is available.
    pub force_pipe: bool,

    /// Delay before pipe sessions get their startup carriage return.
    pub kick_delay_ms: u64,

    /// How long to wait for remaining output after a process exits.
    pub drain_grace_ms: u64,

    /// How often exited sessions are removed from the registry.
    pub cleanup_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            default_cols: DEFAULT_COLS,
            default_rows: DEFAULT_ROWS,
            max_sessions: 10,
            force_pipe: false,
            kick_delay_ms: 100,
            drain_grace_ms: 500,
            cleanup_interval_secs: 60,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ptyhost")
        .join("config.toml")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|shell| !shell.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Interprets a boolean-ish environment value.
fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PTYHOST_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PTYHOST_FORCE_PIPE: Force pipe emulation when set to 1, true or yes
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(value) = std::env::var(ENV_FORCE_PIPE) {
            if !value.is_empty() {
                let force_pipe = parse_flag(&value);
                tracing::info!("Overriding force_pipe from environment: {}", force_pipe);
                self.session.force_pipe = force_pipe;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;

        if session.max_sessions < 1 || session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }

        if session.default_cols == 0 || session.default_rows == 0 {
            return Err(ConfigError::InvalidGeometry {
                cols: session.default_cols,
                rows: session.default_rows,
            });
        }

        if session.kick_delay_ms > 10_000 {
            return Err(ConfigError::InvalidKickDelay(session.kick_delay_ms));
        }

        if session.drain_grace_ms > 60_000 {
            return Err(ConfigError::InvalidDrainGrace(session.drain_grace_ms));
        }

        if session.cleanup_interval_secs < 1 || session.cleanup_interval_secs > 3600 {
            return Err(ConfigError::InvalidCleanupInterval(
                session.cleanup_interval_secs,
            ));
        }

        // Absolute paths must exist, bare names must resolve through PATH.
        let shell_path = Path::new(&session.default_shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&session.default_shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(session.default_shell.clone()));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
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

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
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
