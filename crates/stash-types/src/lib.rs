//! Shared types for Stash
//!
//! This crate contains the data structures shared by the core engine
//! and the CLI. Nothing in here performs I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// Task Types
// ============================================================================

/// Status of a download task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Downloading,
    Paused,
    Saving,
    Success,
    Error,
    Cancelled,
}

impl TaskStatus {
    /// Active tasks own their id: a second request for the same id is not a new task
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskStatus::Queued | TaskStatus::Downloading | TaskStatus::Paused | TaskStatus::Saving
        )
    }

    /// The attempt is over and a new request for the id starts from scratch
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Cancelled)
    }

    /// States that only make sense while a transfer is running in this process
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            TaskStatus::Queued | TaskStatus::Downloading | TaskStatus::Saving
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Paused => "paused",
            TaskStatus::Saving => "saving",
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque transfer state captured on pause.
///
/// Only the engine that produced it knows how to read it; everything else
/// passes it along unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeSnapshot(String);

impl ResumeSnapshot {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

/// Represents a single tracked download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: String,
    pub source_url: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    pub destination_file_name: String,
    #[serde(default)]
    pub bytes_written: u64,
    #[serde(default)]
    pub bytes_total: Option<u64>,
    #[serde(default)]
    pub progress: f64,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_snapshot: Option<ResumeSnapshot>,
    #[serde(default)]
    pub original_metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadTask {
    /// Create a queued task for a validated request
    pub fn new(request: DownloadRequest, destination_file_name: String) -> Self {
        let now = Utc::now();
        Self {
            id: request.id,
            source_url: request.source_url,
            thumbnail_url: request.thumbnail_url,
            destination_file_name,
            bytes_written: 0,
            bytes_total: None,
            progress: 0.0,
            status: TaskStatus::Queued,
            error_message: None,
            resume_snapshot: None,
            original_metadata: request.metadata,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `status`, dropping fields that are only valid in other states
    pub fn set_status(&mut self, status: TaskStatus) {
        if status != TaskStatus::Error {
            self.error_message = None;
        }
        if status != TaskStatus::Paused {
            self.resume_snapshot = None;
        }
        self.status = status;
        self.touch();
    }

    /// Mark the task failed with a user-facing message
    pub fn fail(&mut self, message: impl Into<String>) {
        self.set_status(TaskStatus::Error);
        self.error_message = Some(message.into());
    }

    /// Record a new transfer position. A `None` total keeps the known one.
    pub fn record_progress(&mut self, written: u64, total: Option<u64>) {
        self.bytes_written = written;
        if total.is_some() {
            self.bytes_total = total;
        }
        self.progress = progress_ratio(self.bytes_written, self.bytes_total);
        self.touch();
    }

    /// Back to byte zero; the total is rediscovered by the next response
    pub fn reset_progress(&mut self) {
        self.bytes_written = 0;
        self.bytes_total = None;
        self.progress = 0.0;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Check a record read back from storage
    pub fn validate(&self) -> Result<(), InvalidRequest> {
        validate_task_id(&self.id)?;
        validate_source_url(&self.source_url)?;
        if self.destination_file_name.is_empty()
            || self.destination_file_name.contains(['/', '\\'])
        {
            return Err(InvalidRequest::FileName(self.destination_file_name.clone()));
        }
        Ok(())
    }
}

/// `written / total`, clamped to `[0, 1]`; zero while the total is unknown
pub fn progress_ratio(written: u64, total: Option<u64>) -> f64 {
    match total {
        Some(total) if total > 0 => (written as f64 / total as f64).clamp(0.0, 1.0),
        _ => 0.0,
    }
}

/// A caller's request to download one asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub id: String,
    pub source_url: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl DownloadRequest {
    pub fn new(id: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_url: source_url.into(),
            thumbnail_url: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_thumbnail(mut self, url: impl Into<String>) -> Self {
        self.thumbnail_url = Some(url.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Reject malformed requests before they reach the store
    pub fn validate(&self) -> Result<(), InvalidRequest> {
        validate_task_id(&self.id)?;
        validate_source_url(&self.source_url)
    }
}

/// Why a request or stored record was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidRequest {
    #[error("task id must not be empty")]
    EmptyId,

    #[error("task id {0:?} is not usable in a file name")]
    UnsafeId(String),

    #[error("invalid source url {url:?}: {reason}")]
    SourceUrl { url: String, reason: String },

    #[error("invalid destination file name {0:?}")]
    FileName(String),
}

/// Task ids end up in file names, so they must be a single safe path component
pub fn validate_task_id(id: &str) -> Result<(), InvalidRequest> {
    if id.is_empty() {
        return Err(InvalidRequest::EmptyId);
    }
    let unsafe_char = id
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_whitespace() || c.is_control());
    if unsafe_char || id.contains("..") {
        return Err(InvalidRequest::UnsafeId(id.to_string()));
    }
    Ok(())
}

/// Only absolute http(s) URLs with a host can be streamed
pub fn validate_source_url(raw: &str) -> Result<(), InvalidRequest> {
    let reject = |reason: &str| InvalidRequest::SourceUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };
    let parsed = url::Url::parse(raw).map_err(|e| reject(&e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(reject("unsupported scheme"));
    }
    if parsed.host_str().is_none() {
        return Err(reject("missing host"));
    }
    Ok(())
}

// ============================================================================
// Notification Types
// ============================================================================

/// Severity of a user-facing notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    Success,
    Error,
    Info,
}

// ============================================================================
// Settings Types
// ============================================================================

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Where transfers write their files (None = `<data dir>/downloads`)
    pub download_dir: Option<PathBuf>,
    /// Where the bundled gallery publisher commits finished files
    pub gallery_dir: PathBuf,
    /// First part of `<prefix>_<id>.<ext>`
    pub file_prefix: String,
    /// Extension of destination files, without the dot
    pub file_extension: String,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    /// Minimum gap between progress reports of one transfer (0 = every chunk)
    pub progress_interval_ms: u64,
    /// Restart-from-zero attempts allowed within one resume
    pub max_resume_restarts: u32,
}

impl Settings {
    /// Deterministic destination file name for a task id
    pub fn file_name_for(&self, id: &str) -> String {
        if self.file_extension.is_empty() {
            format!("{}_{}", self.file_prefix, id)
        } else {
            format!("{}_{}.{}", self.file_prefix, id, self.file_extension)
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: None,
            gallery_dir: dirs::picture_dir()
                .map(|p| p.join("Stash"))
                .unwrap_or_else(|| PathBuf::from("gallery")),
            file_prefix: "stash".to_string(),
            file_extension: "jpg".to_string(),
            user_agent: concat!("stash/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout_secs: 30,
            progress_interval_ms: 250,
            max_resume_restarts: 3,
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the core to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    TaskUpdated { task: DownloadTask },
    TaskRemoved { id: String },
    Notice { message: String, kind: NoticeKind },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> DownloadTask {
        let request = DownloadRequest::new("42", "https://images.example.com/42.jpg");
        DownloadTask::new(request, "stash_42.jpg".to_string())
    }

    #[test]
    fn test_progress_ratio_clamps_and_handles_unknown_total() {
        assert_eq!(progress_ratio(5, None), 0.0);
        assert_eq!(progress_ratio(5, Some(0)), 0.0);
        assert_eq!(progress_ratio(5, Some(10)), 0.5);
        assert_eq!(progress_ratio(15, Some(10)), 1.0);
    }

    #[test]
    fn test_set_status_drops_stale_fields() {
        let mut task = task();
        task.fail("Download failed");
        assert_eq!(task.error_message.as_deref(), Some("Download failed"));

        task.set_status(TaskStatus::Paused);
        assert!(task.error_message.is_none());

        task.resume_snapshot = Some(ResumeSnapshot::new("opaque"));
        task.set_status(TaskStatus::Downloading);
        assert!(task.resume_snapshot.is_none());
    }

    #[test]
    fn test_record_progress_keeps_known_total() {
        let mut task = task();
        task.record_progress(2, Some(10));
        task.record_progress(4, None);
        assert_eq!(task.bytes_total, Some(10));
        assert!((task.progress - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_task_id_validation() {
        assert!(validate_task_id("abc-123_X").is_ok());
        assert_eq!(validate_task_id(""), Err(InvalidRequest::EmptyId));
        assert!(validate_task_id("../etc").is_err());
        assert!(validate_task_id("a/b").is_err());
        assert!(validate_task_id("a b").is_err());
    }

    #[test]
    fn test_source_url_validation() {
        assert!(validate_source_url("https://example.com/a.jpg").is_ok());
        assert!(validate_source_url("ftp://example.com/a.jpg").is_err());
        assert!(validate_source_url("not a url").is_err());
    }

    #[test]
    fn test_file_name_for_is_deterministic() {
        let settings = Settings::default();
        assert_eq!(settings.file_name_for("42"), "stash_42.jpg");
        assert_eq!(settings.file_name_for("42"), settings.file_name_for("42"));

        let bare = Settings {
            file_extension: String::new(),
            ..Settings::default()
        };
        assert_eq!(bare.file_name_for("42"), "stash_42");
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&TaskStatus::Downloading).unwrap();
        assert_eq!(json, "\"downloading\"");
    }
}
