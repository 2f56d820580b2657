/*
    error.rs - Error types for property and container synchronization

    Covers:
    - Peer mutations rejected by access policy
    - Values that do not match a declared type
    - Stale peer updates
    - Malformed wire input
*/

use thiserror::Error;

/// Errors raised by the property store, containers and session
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    /// Peer attempted a mutation the access policy forbids
    #[error("Access denied for '{property}': {reason}")]
    AccessDenied { property: String, reason: String },

    /// Assigned value does not match the declared capability
    #[error("Type mismatch for '{property}': expected {expected}, found {found}")]
    TypeMismatch {
        property: String,
        expected: String,
        found: String,
    },

    /// Peer update was based on an outdated content version
    #[error("Version conflict: server holds {known}, peer sent {received}")]
    VersionConflict { known: u64, received: u64 },

    #[error("Unknown property: {0}")]
    UnknownProperty(String),

    #[error("Unknown component: {0}")]
    UnknownComponent(String),

    #[error("Invalid property path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("Malformed update: {0}")]
    MalformedUpdate(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl SyncError {
    pub fn access_denied(property: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::AccessDenied {
            property: property.into(),
            reason: reason.into(),
        }
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, SyncError::AccessDenied { .. })
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

/// Result type for synchronization operations
pub type SyncResult<T> = Result<T, SyncError>;
