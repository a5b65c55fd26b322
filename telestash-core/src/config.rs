//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/telestash/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/telestash/` (~/.config/telestash/)
//! - Data: `$XDG_DATA_HOME/telestash/` (~/.local/share/telestash/)
//! - State/Logs: `$XDG_STATE_HOME/telestash/` (~/.local/state/telestash/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Collection endpoint configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Request and event queue bounds
    #[serde(default)]
    pub queue: QueueConfig,

    /// Initial device identity
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Collection endpoint configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Server URL (e.g., `https://telemetry.example.com`)
    pub url: Option<String>,

    /// Application key sent with every request
    pub app_key: Option<String>,

    /// Application version reported in session metrics
    pub app_version: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Salt for the `checksum256` parameter; no checksum when unset
    pub salt: Option<String>,

    /// Static headers added to every delivery
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Seconds the dispatcher idles between drain cycles when not woken
    #[serde(default = "default_idle_interval")]
    pub idle_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: None,
            app_key: None,
            app_version: None,
            timeout_secs: default_timeout(),
            salt: None,
            headers: BTreeMap::new(),
            idle_interval_secs: default_idle_interval(),
        }
    }
}

impl ServerConfig {
    /// Check if the endpoint is configured well enough to deliver requests
    pub fn is_ready(&self) -> bool {
        self.url.is_some() && self.app_key.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| Error::Config("server.url is required".to_string()))?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "server.url must start with http:// or https://, got {url:?}"
            )));
        }
        match self.app_key.as_deref() {
            Some(key) if !key.is_empty() => {}
            _ => {
                return Err(Error::Config(
                    "server.app_key is required and cannot be empty".to_string(),
                ))
            }
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "server.timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_idle_interval() -> u64 {
    10
}

/// Request and event queue configuration
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Soft bound on queued requests
    #[serde(default = "default_max_request_queue_size")]
    pub max_request_queue_size: usize,

    /// Evict at most 101 requests per append instead of the whole overflow
    #[serde(default = "default_true")]
    pub gradual_cleanup_enabled: bool,

    /// When false, nothing new reaches the queue
    #[serde(default = "default_true")]
    pub tracking_enabled: bool,

    /// Buffered events that trigger a flush
    #[serde(default = "default_event_queue_threshold")]
    pub event_queue_threshold: usize,

    /// Seconds between timer-driven flushes
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_request_queue_size: default_max_request_queue_size(),
            gradual_cleanup_enabled: true,
            tracking_enabled: true,
            event_queue_threshold: default_event_queue_threshold(),
            flush_interval_secs: default_flush_interval(),
        }
    }
}

impl QueueConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.max_request_queue_size == 0 {
            return Err(Error::Config(
                "queue.max_request_queue_size must be at least 1".to_string(),
            ));
        }
        if self.event_queue_threshold == 0 {
            return Err(Error::Config(
                "queue.event_queue_threshold must be at least 1".to_string(),
            ));
        }
        if self.flush_interval_secs == 0 {
            return Err(Error::Config(
                "queue.flush_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_max_request_queue_size() -> usize {
    1000
}

fn default_event_queue_threshold() -> usize {
    100
}

fn default_flush_interval() -> u64 {
    60
}

/// Initial device identity configuration
#[derive(Debug, Deserialize, Default, Clone)]
pub struct IdentityConfig {
    /// Developer supplied device ID
    pub device_id: Option<String>,

    /// Start in temporary ID mode when no device ID is supplied
    #[serde(default)]
    pub temporary_id_mode: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.queue.validate()?;
        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/telestash/config.toml` (~/.config/telestash/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("telestash").join("config.toml")
    }

    /// Returns the data directory path (for the SQLite store)
    ///
    /// `$XDG_DATA_HOME/telestash/` (~/.local/share/telestash/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("telestash")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/telestash/` (~/.local/state/telestash/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("telestash")
    }

    /// Returns the store file path
    ///
    /// `$XDG_DATA_HOME/telestash/store.db` (~/.local/share/telestash/store.db)
    pub fn store_path() -> PathBuf {
        Self::data_dir().join("store.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/telestash/telestash.log` (~/.local/state/telestash/telestash.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("telestash.log")
    }
}
