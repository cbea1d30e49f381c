//! Error types for scheduler and IOCB operations.

use std::sync::Arc;

use thiserror::Error;

use crate::core::iocb::{IocbId, IocbState};

/// Errors produced by IOCBs, queues, and controllers.
///
/// The type is `Clone` because an aborted IOCB keeps its error and hands a
/// copy to every reader.
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// The IOCB was not in a state that allows the requested transition.
    #[error("invalid state transition for iocb {id}: {from:?} -> {to:?}")]
    InvalidStateTransition {
        /// IOCB identifier.
        id: IocbId,
        /// State the IOCB was in.
        from: IocbState,
        /// State that was requested.
        to: IocbState,
    },
    /// Completion or abort targeted an IOCB that is not the controller's active one.
    #[error("iocb {0} is not the current iocb")]
    NotCurrentIocb(IocbId),
    /// A routing controller received an IOCB without a destination.
    #[error("iocb {0} has no destination")]
    MissingDestination(IocbId),
    /// The IOCB timed out before a response arrived.
    #[error("timeout")]
    Timeout,
    /// Opaque failure reported by the processing strategy.
    #[error("processing error: {0}")]
    Processing(Arc<anyhow::Error>),
    /// Aborted by the issuer or a collaborator with a free-form reason.
    #[error("aborted: {0}")]
    Aborted(String),
}

impl IoError {
    /// Wrap a strategy failure.
    pub fn processing(err: anyhow::Error) -> Self {
        Self::Processing(Arc::new(err))
    }

    /// Returns true for the timeout variant.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<anyhow::Error> for IoError {
    fn from(err: anyhow::Error) -> Self {
        Self::processing(err)
    }
}

/// Errors produced by the task scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Neither an absolute time nor a delay was given and the task has no prior due time.
    #[error("missing schedule for task {0}")]
    MissingSchedule(u64),
    /// The requested due time is past what the clock can represent.
    #[error("due time for task {0} is out of range")]
    DeadlineOverflow(u64),
    /// The dispatch thread is already running.
    #[error("scheduler already running")]
    AlreadyRunning,
    /// The dispatch thread could not be spawned.
    #[error("failed to spawn dispatch thread: {0}")]
    Spawn(#[from] std::io::Error),
    /// Configuration rejected during validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_error_display() {
        let err = IoError::processing(anyhow::anyhow!("socket closed"));
        assert_eq!(err.to_string(), "processing error: socket closed");
        assert!(!err.is_timeout());
        assert!(IoError::Timeout.is_timeout());
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = IoError::InvalidStateTransition {
            id: 7,
            from: IocbState::Completed,
            to: IocbState::Active,
        };
        assert_eq!(
            err.to_string(),
            "invalid state transition for iocb 7: Completed -> Active"
        );
    }
}
