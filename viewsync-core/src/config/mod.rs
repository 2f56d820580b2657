//! Configuration for the sync engine
//!
//! Defaults, TOML files and `VIEWSYNC_<SECTION>_<KEY>` environment overrides.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub dispatcher: DispatcherConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Event dispatcher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Name given to the owner thread
    pub thread_name: String,

    /// How long the top-level loop blocks before re-scanning the queue
    #[serde(with = "humantime_serde")]
    pub idle_wait: Duration,

    /// Timeout used by `suspend` callers that do not pass their own
    #[serde(with = "humantime_serde")]
    pub default_suspend_timeout: Duration,

    /// Queue length above which a warning is logged on submit
    pub queue_warn_threshold: usize,
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Round-trip deadline for API calls to the peer
    #[serde(with = "humantime_serde")]
    pub api_call_timeout: Duration,

    /// Flush dirty state to the transport after every inbound message
    pub flush_after_each_unit: bool,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    pub json_format: bool,
    pub with_target: bool,
}

/// Metrics configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            thread_name: "viewsync-dispatcher".to_string(),
            idle_wait: Duration::from_millis(250),
            default_suspend_timeout: Duration::from_secs(60),
            queue_warn_threshold: 1_000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_call_timeout: Duration::from_secs(60),
            flush_after_each_unit: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_target: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn env_override<T>(key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = env::var(key) {
        *slot = raw
            .parse::<T>()
            .map_err(|e| ConfigError::EnvOverride {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
    }
    Ok(())
}

fn env_duration(key: &str, slot: &mut Duration) -> Result<(), ConfigError> {
    if let Ok(raw) = env::var(key) {
        *slot = humantime_serde::re::humantime::parse_duration(&raw)
            .map_err(|e| ConfigError::EnvOverride {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
    }
    Ok(())
}

impl SyncConfig {
    /// Load configuration from environment variables on top of the defaults
    ///
    /// Example: `VIEWSYNC_DISPATCHER_IDLE_WAIT=100ms`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `VIEWSYNC_*` overrides to an existing configuration
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(name) = env::var("VIEWSYNC_DISPATCHER_THREAD_NAME") {
            self.dispatcher.thread_name = name;
        }
        env_duration("VIEWSYNC_DISPATCHER_IDLE_WAIT", &mut self.dispatcher.idle_wait)?;
        env_duration(
            "VIEWSYNC_DISPATCHER_SUSPEND_TIMEOUT",
            &mut self.dispatcher.default_suspend_timeout,
        )?;
        env_override(
            "VIEWSYNC_DISPATCHER_QUEUE_WARN_THRESHOLD",
            &mut self.dispatcher.queue_warn_threshold,
        )?;

        env_duration("VIEWSYNC_SESSION_API_CALL_TIMEOUT", &mut self.session.api_call_timeout)?;
        env_override(
            "VIEWSYNC_SESSION_FLUSH_AFTER_EACH_UNIT",
            &mut self.session.flush_after_each_unit,
        )?;

        if let Ok(level) = env::var("VIEWSYNC_LOG_LEVEL") {
            self.logging.level = level;
        }
        env_override("VIEWSYNC_LOG_JSON", &mut self.logging.json_format)?;
        env_override("VIEWSYNC_METRICS_ENABLED", &mut self.metrics.enabled)?;
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatcher.idle_wait.is_zero() {
            return Err(ConfigError::invalid(
                "dispatcher.idle_wait",
                "the owner thread would spin without waiting",
            ));
        }
        if self.dispatcher.default_suspend_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "dispatcher.default_suspend_timeout",
                "every suspension would time out at once",
            ));
        }
        if self.dispatcher.thread_name.is_empty() {
            return Err(ConfigError::invalid("dispatcher.thread_name", "must not be empty"));
        }
        if self.session.api_call_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "session.api_call_timeout",
                "peer calls could never be answered",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "warning", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::invalid(
                "logging.level",
                format!("unknown level '{}'", self.logging.level),
            ));
        }

        Ok(())
    }

    /// Render as TOML, the format `from_file` reads
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Render(e.to_string()))
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = self.to_toml()?;

        std::fs::write(path, contents).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(())
    }
}
