//! Error types for Stash core

use crate::publish::PublishError;
use stash_types::InvalidRequest;
use thiserror::Error;

/// Errors returned by the public API
#[derive(Debug, Error)]
pub enum StashError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] InvalidRequest),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transfer already running: {0}")]
    AlreadyRunning(String),
}

/// Errors raised inside a single transfer run
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Server responded with {status}")]
    HttpStatus { status: u16 },

    #[error("Stream ended after {received} of {expected} bytes")]
    Incomplete { expected: u64, received: u64 },

    #[error("IO error: {0}")]
    Io(std::io::Error),

    /// The resume snapshot could not be honored; never shown to the user
    #[error("Resume rejected: {0}")]
    ResumeRejected(String),

    #[error("Publish failed: {0}")]
    Publish(#[from] PublishError),

    /// The transfer lost its controller without being asked to stop
    #[error("Transfer aborted")]
    Aborted,
}

impl From<std::io::Error> for TransferError {
    fn from(error: std::io::Error) -> Self {
        if error.kind() == std::io::ErrorKind::PermissionDenied {
            TransferError::PermissionDenied(error.to_string())
        } else {
            TransferError::Io(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_io_errors_are_classified() {
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        assert!(matches!(
            TransferError::from(denied),
            TransferError::PermissionDenied(_)
        ));

        let full = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert!(matches!(TransferError::from(full), TransferError::Io(_)));
    }
}
