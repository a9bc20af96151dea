//! Recovery policy
//!
//! Decides which status changes are legal and what a failed transfer means
//! for the task: a rejected resume is retried from byte zero, everything else
//! is mapped onto the user-facing failure taxonomy.

use crate::error::TransferError;
use serde::{Deserialize, Serialize};
use stash_types::TaskStatus;

/// User-facing failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    PermissionDenied,
    NetworkFailure,
    PublishFailure,
    /// Not a failure from the user's point of view; never notified
    UserCancelled,
}

impl FailureKind {
    /// Text handed to the notification sink, if any
    pub fn notice(self) -> Option<&'static str> {
        match self {
            FailureKind::PermissionDenied => Some("Permission denied"),
            FailureKind::NetworkFailure => Some("Download failed"),
            FailureKind::PublishFailure => Some("Saving to gallery failed"),
            FailureKind::UserCancelled => None,
        }
    }

    /// Status the task ends up in
    pub fn status(self) -> TaskStatus {
        match self {
            FailureKind::UserCancelled => TaskStatus::Cancelled,
            _ => TaskStatus::Error,
        }
    }
}

/// Map an engine error onto the failure taxonomy
pub fn classify(error: &TransferError) -> FailureKind {
    match error {
        TransferError::PermissionDenied(_) => FailureKind::PermissionDenied,
        TransferError::Publish(crate::publish::PublishError::PermissionDenied(_)) => {
            FailureKind::PermissionDenied
        }
        TransferError::Publish(_) => FailureKind::PublishFailure,
        TransferError::Aborted => FailureKind::UserCancelled,
        TransferError::Network(_)
        | TransferError::HttpStatus { .. }
        | TransferError::Incomplete { .. }
        | TransferError::Io(_)
        | TransferError::ResumeRejected(_) => FailureKind::NetworkFailure,
    }
}

/// What to do after a resume attempt was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    RestartFromZero,
    Fail,
}

/// Bounded restart-from-zero policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub max_restarts: u32,
}

impl RecoveryPolicy {
    pub fn new(max_restarts: u32) -> Self {
        Self { max_restarts }
    }

    /// `restarts` is how many restarts this run has already performed
    pub fn decide(&self, error: &TransferError, restarts: u32) -> Decision {
        match error {
            TransferError::ResumeRejected(_) if restarts < self.max_restarts => {
                Decision::RestartFromZero
            }
            _ => Decision::Fail,
        }
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Legal status changes
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;

    if to == Cancelled {
        return true;
    }

    matches!(
        (from, to),
        (Queued, Downloading)
            | (Queued, Error)
            | (Queued, Paused)
            | (Downloading, Paused)
            | (Downloading, Saving)
            | (Downloading, Error)
            | (Saving, Success)
            | (Saving, Error)
            | (Saving, Paused)
            | (Paused, Downloading)
            | (Error, Downloading)
            | (Error, Paused)
            | (Success, Downloading)
            | (Cancelled, Downloading)
    )
}
