//! Errors raised while loading, overriding or saving a `SyncConfig`

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read sync configuration '{path}': {reason}")]
    Read { path: String, reason: String },

    #[error("Cannot write sync configuration '{path}': {reason}")]
    Write { path: String, reason: String },

    #[error("Sync configuration is not valid TOML: {0}")]
    Parse(String),

    #[error("Sync configuration cannot be rendered as TOML: {0}")]
    Render(String),

    /// A `VIEWSYNC_*` variable holds a value of the wrong kind
    #[error("Environment override {key} is invalid: {reason}")]
    EnvOverride { key: String, reason: String },

    /// A loaded value the engine cannot run with
    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }

    /// Dotted name of the offending setting, when there is one
    pub fn field(&self) -> Option<&str> {
        match self {
            ConfigError::Invalid { field, .. } => Some(*field),
            ConfigError::EnvOverride { key, .. } => Some(key.as_str()),
            _ => None,
        }
    }
}
