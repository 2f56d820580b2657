//! Error types for the event dispatcher

use std::time::Duration;
use thiserror::Error;

use super::SuspendId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The suspend deadline elapsed before the wait was resumed
    #[error("Suspension {id} timed out after {after:?}")]
    TimedOut { id: SuspendId, after: Duration },

    /// The wait was cancelled by the owner thread
    #[error("Suspension {id} cancelled: {reason}")]
    Cancelled { id: SuspendId, reason: String },

    #[error("Operation is only allowed on the dispatcher owner thread")]
    NotOwnerThread,

    #[error("Suspension id {0} is already waiting")]
    AlreadySuspended(SuspendId),

    /// Shared state is borrowed by a unit further up the stack
    #[error("Dispatcher state is already borrowed")]
    StateBusy,

    #[error("Dispatcher has shut down")]
    ShutDown,

    #[error("Failed to spawn dispatcher thread: {0}")]
    Spawn(String),
}

impl DispatchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DispatchError::TimedOut { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DispatchError::Cancelled { .. })
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DispatchError::TimedOut {
            id: 7,
            after: Duration::from_millis(20),
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Suspension 7 timed out after 20ms");

        let err = DispatchError::Cancelled {
            id: 3,
            reason: "peer left".into(),
        };
        assert!(err.is_cancelled());
        assert!(err.to_string().contains("peer left"));
    }
}
