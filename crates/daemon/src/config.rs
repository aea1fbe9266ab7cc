//! Configuration management for the termhost daemon.
//!
//! This module provides TOML-based configuration file loading and validation.
//! The default configuration path is `~/.config/termhost/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::env::DEFAULT_PATH_DIRS;
use crate::session::SessionSettings;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("terminal size must be non-zero, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("env_timeout_secs must be between 0 and 300, got {0}")]
    InvalidEnvTimeout(u64),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Upper bound for `env_timeout_secs`.
pub const MAX_ENV_TIMEOUT_SECS: u64 = 300;

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the termhost daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Session management configuration.
    pub session: SessionConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional file that receives a copy of the log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    /// Socket path; the XDG runtime location when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell spawned for every session.
    pub default_shell: String,

    /// Value of `TERM` inside sessions.
    pub term: String,

    pub default_cols: u16,
    pub default_rows: u16,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Ask the login shell for its environment before spawning.
    pub resolve_login_env: bool,

    /// Timeout for login environment resolution, 0 for none.
    pub env_timeout_secs: u64,

    /// Directories guaranteed to be on `PATH` inside sessions.
    pub extra_path_dirs: Vec<String>,

    /// Delay before a start request's initial input is written.
    pub initial_input_delay_ms: u64,

    /// Print a notice when a shell exits on its own.
    pub exit_notice: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
            socket_path: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            term: "xterm-256color".to_string(),
            default_cols: 80,
            default_rows: 24,
            max_sessions: 64,
            resolve_login_env: true,
            env_timeout_secs: 5,
            extra_path_dirs: DEFAULT_PATH_DIRS.iter().map(|d| d.to_string()).collect(),
            initial_input_delay_ms: 500,
            exit_notice: true,
        }
    }
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            shell: config.default_shell.clone(),
            term: config.term.clone(),
            cols: config.default_cols,
            rows: config.default_rows,
            max_sessions: config.max_sessions,
            resolve_login_env: config.resolve_login_env,
            env_timeout: Duration::from_secs(config.env_timeout_secs),
            path_dirs: config.extra_path_dirs.clone(),
            initial_input_delay: Duration::from_millis(config.initial_input_delay_ms),
            exit_notice: config.exit_notice,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termhost")
        .join("config.toml")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    crate::session::pty::detect_shell(None)
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMHOST_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TERMHOST_SHELL: Override the session shell
    /// - TERMHOST_SOCKET: Override the socket path
    pub fn apply_env_overrides(&mut self) {
        if let Some(level) = non_empty_var("TERMHOST_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }

        if let Some(shell) = non_empty_var("TERMHOST_SHELL") {
            tracing::info!("Overriding default_shell from environment: {}", shell);
            self.session.default_shell = shell;
        }

        if let Some(socket) = non_empty_var("TERMHOST_SOCKET") {
            tracing::info!("Overriding socket_path from environment: {}", socket);
            self.daemon.socket_path = Some(PathBuf::from(socket));
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.session.default_cols == 0 || self.session.default_rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: self.session.default_cols,
                rows: self.session.default_rows,
            });
        }

        if self.session.env_timeout_secs > MAX_ENV_TIMEOUT_SECS {
            return Err(ConfigError::InvalidEnvTimeout(self.session.env_timeout_secs));
        }

        let shell_path = Path::new(&self.session.default_shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&self.session.default_shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(
                self.session.default_shell.clone(),
            ));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Socket path from config, or the default location.
    pub fn socket_path(&self) -> PathBuf {
        self.daemon
            .socket_path
            .clone()
            .unwrap_or_else(crate::ipc::get_socket_path)
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
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
