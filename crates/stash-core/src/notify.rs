//! Notification sink
//!
//! Fire-and-forget delivery of short user-facing messages.

use stash_types::NoticeKind;
use tracing::{error, info};

/// Surfaces ephemeral success/error/info messages to the user
pub trait NotificationSink: Send + Sync {
    fn notify(&self, message: &str, kind: NoticeKind);
}

/// Writes notices to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn notify(&self, message: &str, kind: NoticeKind) {
        match kind {
            NoticeKind::Error => error!(target: "stash::notice", "{}", message),
            NoticeKind::Success | NoticeKind::Info => info!(target: "stash::notice", "{}", message),
        }
    }
}
