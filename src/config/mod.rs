//! Configuration management for backpack-replicator
//!
//! This module handles loading and validating configuration from environment variables,
//! files, and command-line arguments.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Shared backoff used by every retry site unless overridden
pub const DEFAULT_BACKOFF_MS: u64 = 1000;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Worker pool configuration
    pub replicator: ReplicatorConfig,

    /// Redis lease queue configuration
    pub queue: QueueConfig,

    /// Coordination service client configuration
    pub coordination: CoordinationConfig,

    /// Content transfer configuration
    pub transfer: TransferConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplicatorConfig {
    /// Number of concurrent worker loops
    pub concurrency: usize,

    /// Backoff shared by every retry site, in milliseconds
    pub backoff_ms: u64,

    /// Wait after an empty or failed dequeue (defaults to `backoff_ms`)
    pub queue_poll_backoff_ms: Option<u64>,

    /// Wait before re-reading a config path after a failure (defaults to `backoff_ms`)
    pub config_read_backoff_ms: Option<u64>,

    /// Wait before re-establishing a failed session (defaults to `backoff_ms`)
    pub session_restart_backoff_ms: Option<u64>,

    /// Capacity of the event broadcast channels
    pub event_channel_capacity: usize,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            backoff_ms: DEFAULT_BACKOFF_MS,
            queue_poll_backoff_ms: None,
            config_read_backoff_ms: None,
            session_restart_backoff_ms: None,
            event_channel_capacity: 256,
        }
    }
}

impl ReplicatorConfig {
    /// Create a config with the given concurrency and default backoffs
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    #[must_use]
    pub fn queue_poll_backoff(&self) -> Duration {
        Duration::from_millis(self.queue_poll_backoff_ms.unwrap_or(self.backoff_ms))
    }

    #[must_use]
    pub fn config_read_backoff(&self) -> Duration {
        Duration::from_millis(self.config_read_backoff_ms.unwrap_or(self.backoff_ms))
    }

    #[must_use]
    pub fn session_restart_backoff(&self) -> Duration {
        Duration::from_millis(self.session_restart_backoff_ms.unwrap_or(self.backoff_ms))
    }
}

/// Redis lease queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// How long a lease stays valid without renewal
    pub lease_timeout_secs: u64,

    /// Delay between connection attempts to a queue server
    pub connect_backoff_ms: u64,

    /// Capacity of the queue error channel
    pub error_channel_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_timeout_secs: 60,
            connect_backoff_ms: DEFAULT_BACKOFF_MS,
            error_channel_capacity: 64,
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    #[must_use]
    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }
}

/// HTTP config store client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Interval between polls of a watched path
    pub poll_interval_ms: u64,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,

    /// Consecutive poll failures after which the session expires
    pub failure_threshold: u32,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            request_timeout_secs: 10,
            failure_threshold: 3,
        }
    }
}

impl CoordinationConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Content transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// User agent sent to storage nodes
    pub user_agent: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            user_agent: format!("backpack-replicator/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl TransferConfig {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for environment variable {var}: {value}")]
    InvalidEnv { var: String, value: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

fn env_or<T: FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnv {
            var: var.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

fn env_opt<T: FromStr>(var: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                var: var.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from `BACKPACK_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let replicator = ReplicatorConfig {
            concurrency: env_or("BACKPACK_CONCURRENCY", defaults.replicator.concurrency)?,
            backoff_ms: env_or("BACKPACK_BACKOFF_MS", defaults.replicator.backoff_ms)?,
            queue_poll_backoff_ms: env_opt("BACKPACK_QUEUE_POLL_BACKOFF_MS")?,
            config_read_backoff_ms: env_opt("BACKPACK_CONFIG_READ_BACKOFF_MS")?,
            session_restart_backoff_ms: env_opt("BACKPACK_SESSION_RESTART_BACKOFF_MS")?,
            event_channel_capacity: defaults.replicator.event_channel_capacity,
        };

        let queue = QueueConfig {
            lease_timeout_secs: env_or(
                "BACKPACK_LEASE_TIMEOUT",
                defaults.queue.lease_timeout_secs,
            )?,
            connect_backoff_ms: env_or(
                "BACKPACK_QUEUE_CONNECT_BACKOFF_MS",
                defaults.queue.connect_backoff_ms,
            )?,
            ..defaults.queue
        };

        let coordination = CoordinationConfig {
            poll_interval_ms: env_or(
                "BACKPACK_POLL_INTERVAL_MS",
                defaults.coordination.poll_interval_ms,
            )?,
            request_timeout_secs: env_or(
                "BACKPACK_REQUEST_TIMEOUT",
                defaults.coordination.request_timeout_secs,
            )?,
            failure_threshold: env_or(
                "BACKPACK_FAILURE_THRESHOLD",
                defaults.coordination.failure_threshold,
            )?,
        };

        let transfer = TransferConfig {
            connect_timeout_secs: env_or(
                "BACKPACK_CONNECT_TIMEOUT",
                defaults.transfer.connect_timeout_secs,
            )?,
            user_agent: std::env::var("BACKPACK_USER_AGENT")
                .unwrap_or(defaults.transfer.user_agent),
        };

        let logging = LoggingConfig {
            level: std::env::var("BACKPACK_LOG_LEVEL").unwrap_or(defaults.logging.level),
            format: std::env::var("BACKPACK_LOG_FORMAT").unwrap_or(defaults.logging.format),
        };

        Ok(Self {
            replicator,
            queue,
            coordination,
            transfer,
            logging,
        })
    }

    /// Load configuration from a TOML file; missing sections take defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replicator.concurrency == 0 {
            return Err(invalid("replicator.concurrency", "Must be at least 1"));
        }

        let backoffs = [
            ("replicator.backoff_ms", Some(self.replicator.backoff_ms)),
            (
                "replicator.queue_poll_backoff_ms",
                self.replicator.queue_poll_backoff_ms,
            ),
            (
                "replicator.config_read_backoff_ms",
                self.replicator.config_read_backoff_ms,
            ),
            (
                "replicator.session_restart_backoff_ms",
                self.replicator.session_restart_backoff_ms,
            ),
        ];
        for (field, value) in backoffs {
            if value == Some(0) {
                return Err(invalid(field, "Backoff must be greater than 0"));
            }
        }

        if self.replicator.event_channel_capacity == 0 {
            return Err(invalid("replicator.event_channel_capacity", "Must be at least 1"));
        }

        if self.queue.error_channel_capacity == 0 {
            return Err(invalid("queue.error_channel_capacity", "Must be at least 1"));
        }

        if self.queue.lease_timeout_secs == 0 {
            return Err(invalid("queue.lease_timeout_secs", "Must be greater than 0"));
        }

        if self.coordination.failure_threshold == 0 {
            return Err(invalid("coordination.failure_threshold", "Must be at least 1"));
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(invalid("logging.format", "Expected 'text' or 'json'"));
        }

        Ok(())
    }

    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Builder for [`Config`]
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    base: Option<Config>,
    concurrency: Option<usize>,
    backoff_ms: Option<u64>,
    queue_poll_backoff_ms: Option<u64>,
    config_read_backoff_ms: Option<u64>,
    session_restart_backoff_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    log_format: Option<String>,
}

impl ConfigBuilder {
    /// Start from an existing config instead of the defaults
    pub fn base(mut self, config: Config) -> Self {
        self.base = Some(config);
        self
    }

    /// Set worker concurrency
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Set the shared backoff
    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff_ms = Some(backoff.as_millis() as u64);
        self
    }

    /// Override the dequeue backoff
    pub fn queue_poll_backoff(mut self, backoff: Duration) -> Self {
        self.queue_poll_backoff_ms = Some(backoff.as_millis() as u64);
        self
    }

    /// Override the config read backoff
    pub fn config_read_backoff(mut self, backoff: Duration) -> Self {
        self.config_read_backoff_ms = Some(backoff.as_millis() as u64);
        self
    }

    /// Override the session restart backoff
    pub fn session_restart_backoff(mut self, backoff: Duration) -> Self {
        self.session_restart_backoff_ms = Some(backoff.as_millis() as u64);
        self
    }

    /// Set the watch poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    /// Set log format
    pub fn log_format(mut self, format: impl Into<String>) -> Self {
        self.log_format = Some(format.into());
        self
    }

    /// Build the config
    pub fn build(self) -> Result<Config, ConfigError> {
        let mut config = self.base.unwrap_or_default();

        if let Some(concurrency) = self.concurrency {
            config.replicator.concurrency = concurrency;
        }
        if let Some(backoff_ms) = self.backoff_ms {
            config.replicator.backoff_ms = backoff_ms;
        }
        if self.queue_poll_backoff_ms.is_some() {
            config.replicator.queue_poll_backoff_ms = self.queue_poll_backoff_ms;
        }
        if self.config_read_backoff_ms.is_some() {
            config.replicator.config_read_backoff_ms = self.config_read_backoff_ms;
        }
        if self.session_restart_backoff_ms.is_some() {
            config.replicator.session_restart_backoff_ms = self.session_restart_backoff_ms;
        }
        if let Some(poll_interval_ms) = self.poll_interval_ms {
            config.coordination.poll_interval_ms = poll_interval_ms;
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.replicator.concurrency, 1);
    }

    #[test]
    fn test_invalid_concurrency() {
        let mut config = Config::default();
        config.replicator.concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_backoff_override_rejected() {
        let mut config = Config::default();
        config.replicator.config_read_backoff_ms = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_overrides_fall_back_to_shared_value() {
        let mut config = ReplicatorConfig::default();
        config.backoff_ms = 250;
        config.session_restart_backoff_ms = Some(5000);

        assert_eq!(config.queue_poll_backoff(), Duration::from_millis(250));
        assert_eq!(config.config_read_backoff(), Duration::from_millis(250));
        assert_eq!(config.session_restart_backoff(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [replicator]
            concurrency = 8

            [queue]
            lease_timeout_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.replicator.concurrency, 8);
        assert_eq!(config.replicator.backoff_ms, DEFAULT_BACKOFF_MS);
        assert_eq!(config.queue.lease_timeout(), Duration::from_secs(30));
        assert_eq!(config.coordination, CoordinationConfig::default());
    }

    #[test]
    fn test_builder() {
        let config = Config::builder()
            .concurrency(4)
            .backoff(Duration::from_millis(50))
            .config_read_backoff(Duration::from_millis(10))
            .build()
            .unwrap();

        assert_eq!(config.replicator.concurrency, 4);
        assert_eq!(config.replicator.queue_poll_backoff(), Duration::from_millis(50));
        assert_eq!(config.replicator.config_read_backoff(), Duration::from_millis(10));
    }

    #[test]
    fn test_builder_rejects_bad_format() {
        assert!(Config::builder().log_format("xml").build().is_err());
    }
}
