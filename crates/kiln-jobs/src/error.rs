//! Job error types.

use crate::job::JobId;
use std::time::Duration;
use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Malformed enqueue arguments.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A claimed record's kind has no registered handler.
    #[error("Unknown job kind: {0}")]
    UnknownKind(String),

    /// Handler reported a failure; the job may be retried.
    #[error("Job execution failed: {0}")]
    ExecutionFailed(String),

    /// Handler reported a failure that must not be retried.
    #[error("Job failed permanently: {0}")]
    Fatal(String),

    /// Handler stopped because its cancellation signal fired.
    #[error("Job was cancelled")]
    Cancelled,

    /// Handler exceeded its deadline.
    #[error("Job timed out after {0:?}")]
    Timeout(Duration),

    /// Handler panicked.
    #[error("Job panicked: {0}")]
    Panicked(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store I/O or transaction error.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Schema migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Record missing, or not in the state the transition requires.
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// Duplicate registration.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Invalid job or client state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// `stop` returned before every in-flight job finished.
    #[error("Shutdown timed out after {timeout:?} with {in_flight} job(s) still running")]
    ShutdownTimeout { timeout: Duration, in_flight: usize },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Creates an execution failure from any displayable error.
    pub fn failed(err: impl std::fmt::Display) -> Self {
        JobError::ExecutionFailed(err.to_string())
    }

    /// Creates a permanent failure from any displayable error.
    pub fn fatal(err: impl std::fmt::Display) -> Self {
        JobError::Fatal(err.to_string())
    }

    /// Returns true if a job that failed with this error may run again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::ExecutionFailed(_)
                | JobError::Cancelled
                | JobError::Timeout(_)
                | JobError::Panicked(_)
                | JobError::Store(_)
                | JobError::Internal(_)
        )
    }

    /// Short label used for metrics.
    pub fn kind_label(&self) -> &'static str {
        match self {
            JobError::Validation(_) => "validation",
            JobError::UnknownKind(_) => "unknown_kind",
            JobError::ExecutionFailed(_) => "execution_failed",
            JobError::Fatal(_) => "fatal",
            JobError::Cancelled => "cancelled",
            JobError::Timeout(_) => "timeout",
            JobError::Panicked(_) => "panicked",
            JobError::Serialization(_) => "serialization",
            JobError::Store(_) => "store",
            JobError::Migration(_) => "migration",
            JobError::NotFound(_) => "not_found",
            JobError::Conflict(_) => "conflict",
            JobError::InvalidState { .. } => "invalid_state",
            JobError::ShutdownTimeout { .. } => "shutdown_timeout",
            JobError::Configuration(_) => "configuration",
            JobError::Internal(_) => "internal",
        }
    }
}

impl From<JobError> for kiln_core::KilnError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Store(e) => kiln_core::KilnError::Database(e.to_string()),
            JobError::Migration(e) => kiln_core::KilnError::Database(e.to_string()),
            JobError::Configuration(msg) => kiln_core::KilnError::Configuration(msg),
            other => kiln_core::KilnError::Jobs(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_execution_failed() {
        assert!(JobError::failed("oops").is_retryable());
    }

    #[test]
    fn test_is_retryable_timeout() {
        assert!(JobError::Timeout(Duration::from_secs(30)).is_retryable());
    }

    #[test]
    fn test_is_retryable_panicked_and_cancelled() {
        assert!(JobError::Panicked("index out of bounds".into()).is_retryable());
        assert!(JobError::Cancelled.is_retryable());
    }

    #[test]
    fn test_is_not_retryable_fatal() {
        assert!(!JobError::fatal("bad address").is_retryable());
    }

    #[test]
    fn test_is_not_retryable_bad_payload() {
        let err = serde_json::from_str::<u32>("not json").unwrap_err();
        assert!(!JobError::from(err).is_retryable());
    }

    #[test]
    fn test_is_not_retryable_validation() {
        assert!(!JobError::Validation("empty kind".into()).is_retryable());
        assert!(!JobError::UnknownKind("nope".into()).is_retryable());
    }

    #[test]
    fn test_error_display_timeout() {
        let err = JobError::Timeout(Duration::from_secs(60));
        assert!(err.to_string().contains("60s"));
    }

    #[test]
    fn test_error_display_invalid_state() {
        let err = JobError::InvalidState {
            expected: "available".into(),
            actual: "running".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("available") && msg.contains("running"));
    }

    #[test]
    fn test_error_display_shutdown_timeout() {
        let err = JobError::ShutdownTimeout {
            timeout: Duration::from_secs(3),
            in_flight: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("3s") && msg.contains('5'));
    }

    #[test]
    fn test_into_kiln_error() {
        let err: kiln_core::KilnError = JobError::Configuration("no queues".into()).into();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");

        let err: kiln_core::KilnError = JobError::NotFound(JobId::new(7)).into();
        assert_eq!(err.error_code(), "JOBS_ERROR");
        assert!(err.to_string().contains('7'));
    }
}
