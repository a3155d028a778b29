//! Error handling module for drubatch
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Operation handlers return `anyhow::Result` and are never converted into
//! these variants: item failures are swallowed by the worker.

use thiserror::Error;

/// Main error type for the batch engine
#[derive(Error, Debug)]
pub enum BatchError {
    /// No persisted state exists for the requested batch id
    #[error("Batch {0} not found")]
    NotFound(u64),

    /// The store or a queue could not be read or written
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A spawned worker invocation failed
    #[error("Worker invocation {invocation} failed: {message}")]
    Spawn { invocation: usize, message: String },

    /// A spawned worker invocation produced no result at all
    #[error("Worker invocation {invocation} produced no result")]
    EmptyResult { invocation: usize },

    /// A work item or finished callback names an unregistered handler
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// The batch state is internally inconsistent
    #[error("State error: {0}")]
    State(String),

    /// Batch definition validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A worker invocation stopped on an engine error; `message` is the
    /// set's configured error message
    #[error("{message} ({source})")]
    Aborted {
        message: String,
        #[source]
        source: Box<BatchError>,
    },
}

/// Result type alias for batch engine operations
pub type Result<T> = std::result::Result<T, BatchError>;

// Convenient error constructors
impl BatchError {
    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap an engine error with the set's error message
    pub fn aborted(msg: impl Into<String>, source: BatchError) -> Self {
        Self::Aborted {
            message: msg.into(),
            source: Box::new(source),
        }
    }

    /// Create a spawn error for the given driver iteration
    pub fn spawn(invocation: usize, msg: impl Into<String>) -> Self {
        Self::Spawn {
            invocation,
            message: msg.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BatchError::NotFound(42);
        assert_eq!(err.to_string(), "Batch 42 not found");

        let err = BatchError::spawn(3, "exit code 1");
        assert_eq!(err.to_string(), "Worker invocation 3 failed: exit code 1");

        let err = BatchError::EmptyResult { invocation: 2 };
        assert_eq!(err.to_string(), "Worker invocation 2 produced no result");
    }

    #[test]
    fn test_aborted_keeps_source() {
        use std::error::Error as _;

        let err = BatchError::aborted("Import failed.", BatchError::state("queue missing"));
        assert_eq!(err.to_string(), "Import failed. (State error: queue missing)");
        let source = err.source().expect("source");
        assert_eq!(source.to_string(), "State error: queue missing");
    }

    #[test]
    fn test_error_constructors() {
        assert!(matches!(
            BatchError::persistence("disk full"),
            BatchError::Persistence(_)
        ));
        assert!(matches!(BatchError::state("bad cursor"), BatchError::State(_)));
        assert!(matches!(
            BatchError::validation("no sets"),
            BatchError::Validation(_)
        ));
        assert!(matches!(BatchError::config("bad limit"), BatchError::Config(_)));
    }
}
