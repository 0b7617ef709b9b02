//! Request data model and lifecycle state machine

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Lifecycle status of a single work request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Discovered,
    PrefilterRejected,
    Claimed,
    CompetitorWon,
    Downloading,
    DownloadFailed,
    Sanitizing,
    Uploading,
    Fulfilled,
    CancelRequested,
    Cancelled,
    Error,
}

impl RequestStatus {
    /// Terminal states accept no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::PrefilterRejected
                | RequestStatus::CompetitorWon
                | RequestStatus::Fulfilled
                | RequestStatus::Cancelled
                | RequestStatus::Error
        )
    }

    /// States that hold the single concurrency slot
    pub fn holds_slot(self) -> bool {
        matches!(
            self,
            RequestStatus::Claimed
                | RequestStatus::Downloading
                | RequestStatus::DownloadFailed
                | RequestStatus::Sanitizing
                | RequestStatus::Uploading
                | RequestStatus::CancelRequested
        )
    }

    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        use RequestStatus::*;

        if next == Error {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (Discovered, PrefilterRejected)
                | (Discovered, Claimed)
                | (Discovered, CompetitorWon)
                | (Claimed, Downloading)
                | (Claimed, CancelRequested)
                | (Downloading, Sanitizing)
                | (Downloading, DownloadFailed)
                | (Sanitizing, Uploading)
                | (Uploading, Fulfilled)
                | (Uploading, CancelRequested)
                | (DownloadFailed, CancelRequested)
                | (CancelRequested, Cancelled)
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{self:?}"));
        f.write_str(&name)
    }
}

/// A work request discovered on the board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Unique work key (DOI-shaped)
    pub identifier: String,
    /// Board-internal record id, when the payload carried one
    pub record_id: Option<String>,
    /// Relative or absolute link to the request's detail page
    pub detail: String,
    pub requester: String,
    pub reward: String,
    pub title: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub status: RequestStatus,
}

impl Request {
    pub fn new(identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        Self {
            detail: format!("/{identifier}"),
            identifier,
            record_id: None,
            requester: String::new(),
            reward: String::new(),
            title: None,
            discovered_at: Utc::now(),
            status: RequestStatus::Discovered,
        }
    }

    /// Synthetic request used by operator-triggered runs
    pub fn manual(identifier: impl Into<String>) -> Self {
        let mut request = Self::new(identifier);
        request.requester = "manual".to_string();
        request
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow
    pub fn transition(&mut self, next: RequestStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::invalid_transition(self.status, next));
        }
        tracing::debug!(
            identifier = %self.identifier,
            from = %self.status,
            to = %next,
            "Request transition"
        );
        self.status = next;
        Ok(())
    }
}

/// Channel a candidate arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionChannel {
    NetworkTap,
    PageHook,
    Manual,
}

impl fmt::Display for DetectionChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionChannel::NetworkTap => f.write_str("network_tap"),
            DetectionChannel::PageHook => f.write_str("page_hook"),
            DetectionChannel::Manual => f.write_str("manual"),
        }
    }
}

/// A request surfaced by the detector
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub request: Request,
    pub channel: DetectionChannel,
}

/// Reason a request was not pursued, surfaced verbatim on the control channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RejectReason {
    ShortTitlePre,
    BookInTitlePre,
    CompetitorWon,
    ShortTitlePost,
    BookTypePost,
    Other(String),
}

impl RejectReason {
    pub fn code(&self) -> &str {
        match self {
            RejectReason::ShortTitlePre => "short_title_pre",
            RejectReason::BookInTitlePre => "book_in_title_pre",
            RejectReason::CompetitorWon => "competitor_won",
            RejectReason::ShortTitlePost => "short_title_post",
            RejectReason::BookTypePost => "book_type_post",
            RejectReason::Other(text) => text,
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "short_title_pre" => RejectReason::ShortTitlePre,
            "book_in_title_pre" => RejectReason::BookInTitlePre,
            "competitor_won" => RejectReason::CompetitorWon,
            "short_title_post" => RejectReason::ShortTitlePost,
            "book_type_post" => RejectReason::BookTypePost,
            other => RejectReason::Other(other.to_string()),
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl Serialize for RejectReason {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

impl<'de> Deserialize<'de> for RejectReason {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Ok(RejectReason::from_code(&code))
    }
}

/// Outcome of one source during an orchestrator run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceAttempt {
    pub source: String,
    pub succeeded: bool,
    pub error: Option<String>,
}

impl SourceAttempt {
    pub fn success(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            succeeded: true,
            error: None,
        }
    }

    pub fn failure(source: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            succeeded: false,
            error: Some(error.into()),
        }
    }
}

/// A downloaded document on local disk
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentArtifact {
    pub path: PathBuf,
    pub sanitized: bool,
    pub byte_size: u64,
}

impl DocumentArtifact {
    /// Describe the file at `path`, reading its size from disk
    pub fn from_path(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let byte_size = std::fs::metadata(&path)?.len();
        Ok(Self {
            path,
            sanitized: false,
            byte_size,
        })
    }
}
