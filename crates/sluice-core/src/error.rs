//! Error types for Sluice
//!
//! This module defines the error taxonomy shared by every stage of the
//! pipeline. Uses `thiserror` for ergonomic error definitions.
//!
//! Only configuration and timeout failures are meant to reach a caller as
//! `Err`. Validation and execution failures are recovered locally and end
//! up as annotated, lower-confidence answers; cache failures are logged and
//! downgraded to a miss.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type for Sluice operations
#[derive(Error, Debug)]
pub enum SluiceError {
    /// Missing collaborator, credential or invalid setting
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Generated SQL failed static checks
    #[error("Validation error: {message}")]
    Validation {
        /// Summary of the failure
        message: String,
        /// Individual issues reported by the validator
        issues: Vec<String>,
    },

    /// Runtime failure reported by the SQL executor
    #[error("Execution error: {0}")]
    Execution(String),

    /// A collaborator call exceeded its deadline
    #[error("Timeout: {operation} did not complete within {after_ms}ms")]
    Timeout {
        /// Name of the operation that timed out
        operation: String,
        /// Deadline in milliseconds
        after_ms: u64,
    },

    /// Cache backing store failure
    #[error("Cache error: {0}")]
    Cache(String),

    /// An external collaborator (LLM, executor, schema provider) failed
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// JSON or TOML (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Sluice operations
pub type Result<T> = std::result::Result<T, SluiceError>;

impl SluiceError {
    /// Build a timeout error for `operation` with the given deadline
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        SluiceError::Timeout {
            operation: operation.into(),
            after_ms: after.as_millis() as u64,
        }
    }

    /// Returns true if the pipeline can recover from this error by rewriting SQL
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SluiceError::Validation { .. } | SluiceError::Execution(_)
        )
    }

    /// Returns true if this error should abort start-up
    #[cold]
    pub fn is_fatal(&self) -> bool {
        matches!(self, SluiceError::Configuration(_))
    }

    /// Returns true for deadline failures
    pub fn is_timeout(&self) -> bool {
        matches!(self, SluiceError::Timeout { .. })
    }

    /// Stable short category name, used in logs and error-shaped answers
    pub fn category(&self) -> &'static str {
        match self {
            SluiceError::Configuration(_) => "configuration",
            SluiceError::Validation { .. } => "validation",
            SluiceError::Execution(_) => "execution",
            SluiceError::Timeout { .. } => "timeout",
            SluiceError::Cache(_) => "cache",
            SluiceError::Collaborator(_) => "collaborator",
            SluiceError::Serialization(_) => "serialization",
            SluiceError::Io(_) => "io",
            SluiceError::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for SluiceError {
    fn from(err: serde_json::Error) -> Self {
        SluiceError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(SluiceError::Configuration("no api key".to_string()).is_fatal());
        assert!(!SluiceError::Execution("boom".to_string()).is_fatal());
        assert!(SluiceError::Execution("boom".to_string()).is_retryable());
        assert!(SluiceError::Validation {
            message: "bad".to_string(),
            issues: vec![],
        }
        .is_retryable());
        assert!(!SluiceError::timeout("llm", Duration::from_secs(1)).is_retryable());
        assert!(!SluiceError::Cache("down".to_string()).is_retryable());
    }

    #[test]
    fn test_timeout_display() {
        let err = SluiceError::timeout("completion", Duration::from_millis(1500));
        assert!(err.is_timeout());
        assert_eq!(
            err.to_string(),
            "Timeout: completion did not complete within 1500ms"
        );
        assert_eq!(err.category(), "timeout");
    }

    #[test]
    fn test_from_serde_json() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{oops");
        let err: SluiceError = parse.unwrap_err().into();
        assert_eq!(err.category(), "serialization");
    }
}
