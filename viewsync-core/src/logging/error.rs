//! Error types for the logging subsystem

use thiserror::Error;

/// Errors raised while installing the global subscriber
#[derive(Debug, Clone, Error)]
pub enum LoggingError {
    /// A global subscriber is already installed, or the filter was rejected
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// The requested level or filter directive is not understood
    #[error("Invalid logging configuration: {0}")]
    InvalidConfiguration(String),
}
