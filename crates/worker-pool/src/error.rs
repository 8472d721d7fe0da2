//! Pool and launcher error types.

use thiserror::Error;

/// Errors raised by a [`Launcher`](crate::launcher::Launcher) while starting a worker.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The worker process could not be spawned.
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    /// The worker exited before it became ready.
    #[error("Worker exited during startup: {0}")]
    ExitedEarly(String),

    /// The code version moved on every attempt to start a worker for it.
    #[error("Code version changed during {0} consecutive launch attempts")]
    VersionChurn(u32),

    /// The launcher itself failed (panicked or was cancelled).
    #[error("Launcher fault: {0}")]
    Fault(String),
}

/// Errors surfaced by the pool to ingress callers and lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// A worker failed to start.
    #[error("Worker launch failed: {0}")]
    LaunchFailed(String),

    /// The request waited in the admission queue without being bound.
    #[error("Request timed out waiting for a free worker")]
    AdmissionTimeout,

    /// The request was bound to a worker that never answered in time.
    #[error("Worker did not answer the request in time")]
    ResponseTimeout,

    /// The worker holding the request was removed before answering.
    #[error("Worker terminated while handling the request")]
    WorkerTerminated,

    /// The pool is shutting down.
    #[error("Worker pool is shutting down")]
    ShuttingDown,

    /// Configuration error.
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),
}

impl PoolError {
    /// Whether an ingress caller may retry the request.
    ///
    /// `WorkerTerminated` and `ResponseTimeout` count as retryable, but the
    /// first attempt may have partially run on the worker.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::AdmissionTimeout | PoolError::ResponseTimeout | PoolError::WorkerTerminated
        )
    }
}

impl From<LaunchError> for PoolError {
    fn from(e: LaunchError) -> Self {
        PoolError::LaunchFailed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PoolError::AdmissionTimeout;
        assert_eq!(err.to_string(), "Request timed out waiting for a free worker");

        let err = LaunchError::VersionChurn(3);
        assert_eq!(
            err.to_string(),
            "Code version changed during 3 consecutive launch attempts"
        );
    }

    #[test]
    fn test_error_from_launch() {
        let err: PoolError = LaunchError::Spawn("no such file".to_string()).into();
        assert_eq!(
            err,
            PoolError::LaunchFailed("Failed to spawn worker: no such file".to_string())
        );
        assert!(!err.is_retryable());
        assert!(PoolError::WorkerTerminated.is_retryable());
    }
}
