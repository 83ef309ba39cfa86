//! Process-level error type.

use thiserror::Error;

/// A specialized `Result` type for Kiln operations.
pub type KilnResult<T> = Result<T, KilnError>;

/// Unified error type for the Kiln process.
///
/// Library crates keep their own detailed errors and convert into this
/// type at the process boundary.
#[derive(Error, Debug)]
pub enum KilnError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Job queue error
    #[error("Job queue error: {0}")]
    Jobs(String),

    /// Telemetry setup error
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KilnError {
    /// Returns a machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Jobs(_) => "JOBS_ERROR",
            Self::Telemetry(_) => "TELEMETRY_ERROR",
            Self::Internal(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration<T: Into<String>>(message: T) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(KilnError::configuration("x").error_code(), "CONFIGURATION_ERROR");
        assert_eq!(KilnError::Jobs("x".into()).error_code(), "JOBS_ERROR");
        assert_eq!(KilnError::internal("x").error_code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_from_anyhow() {
        let err = KilnError::from(anyhow::anyhow!("boom"));
        assert_eq!(err.error_code(), "INTERNAL_ERROR");
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_display_includes_message() {
        let err = KilnError::Database("connection refused".into());
        assert_eq!(err.to_string(), "Database error: connection refused");
    }
}
