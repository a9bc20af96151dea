//! Resume snapshot encoding
//!
//! The snapshot handed out on pause is JSON of [`ResumeState`]. Everything
//! outside the engine treats it as an opaque string.

use crate::error::TransferError;
use reqwest::header::{HeaderMap, HeaderName, CONTENT_RANGE, ETAG, LAST_MODIFIED};
use serde::{Deserialize, Serialize};
use stash_types::ResumeSnapshot;

/// Where a paused transfer stopped and how to check the remote file is unchanged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    pub url: String,
    pub offset: u64,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
}

impl ResumeState {
    pub fn encode(&self) -> Result<ResumeSnapshot, serde_json::Error> {
        serde_json::to_string(self).map(ResumeSnapshot::new)
    }

    /// Read a snapshot back; anything unusable for `url` is a rejection
    pub fn decode(snapshot: &ResumeSnapshot, url: &str) -> Result<Self, TransferError> {
        let state: ResumeState = serde_json::from_str(snapshot.as_str())
            .map_err(|e| TransferError::ResumeRejected(format!("malformed snapshot: {}", e)))?;

        if state.url != url {
            return Err(TransferError::ResumeRejected(
                "snapshot belongs to a different url".to_string(),
            ));
        }
        Ok(state)
    }

    /// Value for `If-Range`. Weak entity tags are not allowed there.
    pub fn validator(&self) -> Option<&str> {
        match self.etag.as_deref() {
            Some(tag) if !tag.starts_with("W/") => Some(tag),
            _ => self.last_modified.as_deref(),
        }
    }
}

/// Entity validators sent by the server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        };
        Self {
            etag: text(ETAG),
            last_modified: text(LAST_MODIFIED),
        }
    }

    /// Keep what we knew when the server does not repeat it
    pub fn or(self, previous: Validators) -> Self {
        Self {
            etag: self.etag.or(previous.etag),
            last_modified: self.last_modified.or(previous.last_modified),
        }
    }
}

/// Parsed `Content-Range: bytes <start>-<end>/<total>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
        Self::parse(value)
    }

    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("bytes ")?;
        let (range, total) = rest.split_once('/')?;
        let (start, _end) = range.split_once('-')?;

        let start = start.trim().parse().ok()?;
        let total = match total.trim() {
            "*" => None,
            total => Some(total.parse().ok()?),
        };
        Some(Self { start, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ResumeState {
        ResumeState {
            url: "https://example.com/a.jpg".to_string(),
            offset: 4096,
            total: Some(10_000),
            etag: Some("\"abc\"".to_string()),
            last_modified: None,
        }
    }

    #[test]
    fn test_snapshot_decodes_for_same_url() {
        let snapshot = state().encode().unwrap();
        let decoded = ResumeState::decode(&snapshot, "https://example.com/a.jpg").unwrap();
        assert_eq!(decoded, state());
    }

    #[test]
    fn test_garbage_snapshot_is_rejected() {
        let result = ResumeState::decode(&ResumeSnapshot::new("{not json"), "https://example.com/a.jpg");
        assert!(matches!(result, Err(TransferError::ResumeRejected(_))));
    }

    #[test]
    fn test_snapshot_for_other_url_is_rejected() {
        let snapshot = state().encode().unwrap();
        let result = ResumeState::decode(&snapshot, "https://example.com/b.jpg");
        assert!(matches!(result, Err(TransferError::ResumeRejected(_))));
    }

    #[test]
    fn test_weak_etag_falls_back_to_last_modified() {
        let mut state = state();
        assert_eq!(state.validator(), Some("\"abc\""));

        state.etag = Some("W/\"abc\"".to_string());
        assert_eq!(state.validator(), None);

        state.last_modified = Some("Wed, 21 Oct 2015 07:28:00 GMT".to_string());
        assert_eq!(state.validator(), Some("Wed, 21 Oct 2015 07:28:00 GMT"));
    }

    #[test]
    fn test_content_range_parsing() {
        assert_eq!(
            ContentRange::parse("bytes 100-999/1000"),
            Some(ContentRange { start: 100, total: Some(1000) })
        );
        assert_eq!(
            ContentRange::parse("bytes 100-999/*"),
            Some(ContentRange { start: 100, total: None })
        );
        assert_eq!(ContentRange::parse("bytes */1000"), None);
        assert_eq!(ContentRange::parse("items 1-2/3"), None);
    }
}
