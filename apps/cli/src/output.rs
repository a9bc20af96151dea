//! Output formatting utilities

use crate::OutputFormat;
use console::{style, StyledObject};
use indicatif::MultiProgress;
use serde::Serialize;
use stash_core::NotificationSink;
use stash_types::{NoticeKind, TaskStatus};

/// Print output in the specified format
pub fn print_output<T: Serialize + std::fmt::Display>(
    value: &T,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Human | OutputFormat::Table => {
            println!("{}", value);
        }
    }
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

pub fn status_icon(status: TaskStatus) -> StyledObject<&'static str> {
    match status {
        TaskStatus::Success => style("✓").green(),
        TaskStatus::Downloading => style("↓").cyan(),
        TaskStatus::Saving => style("↑").cyan(),
        TaskStatus::Paused => style("⏸").yellow(),
        TaskStatus::Error => style("✗").red(),
        TaskStatus::Cancelled => style("○").dim(),
        TaskStatus::Queued => style("·").dim(),
    }
}

/// Prints notices above any progress bars
pub struct ConsoleNotifier {
    multi: MultiProgress,
    enabled: bool,
}

impl ConsoleNotifier {
    pub fn new(multi: MultiProgress, enabled: bool) -> Self {
        Self { multi, enabled }
    }
}

impl NotificationSink for ConsoleNotifier {
    fn notify(&self, message: &str, kind: NoticeKind) {
        if !self.enabled {
            return;
        }

        let icon = match kind {
            NoticeKind::Success => style("✓").green().bold(),
            NoticeKind::Error => style("✗").red().bold(),
            NoticeKind::Info => style("•").cyan().bold(),
        };
        let _ = self.multi.println(format!("{} {}", icon, message));
    }
}
