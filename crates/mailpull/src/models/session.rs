//! Download session: the persisted unit of mailbox download progress

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use super::EmailId;

/// Current on-disk layout of [`DownloadSession`]
const SESSION_VERSION: u32 = 1;

/// Opaque unique identifier of a download session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a download session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Downloading,
    Paused,
    Completed,
    Cancelled,
    Error,
}

impl SessionStatus {
    /// `completed` and `cancelled` never change again
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }

    /// Whether `resume` may continue this session
    pub fn is_resumable(self) -> bool {
        matches!(self, SessionStatus::Paused | SessionStatus::Error)
    }

    /// Allowed status changes.
    ///
    /// Status only moves forward, except that `downloading` and `paused`
    /// may alternate and an errored session may be resumed.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Initializing, Downloading | Paused | Cancelled | Error) => true,
            (Downloading, Paused | Completed | Cancelled | Error) => true,
            (Paused, Downloading | Cancelled) => true,
            (Error, Downloading | Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Downloading => "downloading",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Error => "error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of progress taken at a successful batch boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub batch_index: u64,
    pub downloaded_count: u64,
    pub dispatched_count: u64,
    pub timestamp: DateTime<Utc>,
    /// Cursor the next batch will be fetched with
    pub cursor: Option<String>,
}

/// Persisted state of one mailbox download
///
/// Only the owning `DownloadManager` mutates a session; every mutation is
/// followed by a full rewrite through the session store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadSession {
    pub id: SessionId,
    /// Whose mailbox is downloaded; fixed for the session's lifetime
    pub user_identity: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Best-effort estimate, 0 means unknown
    pub total_email_count: u64,
    pub downloaded_count: u64,
    pub dispatched_for_vectorization_count: u64,
    pub failed_email_ids: BTreeSet<EmailId>,
    pub current_batch_index: u64,
    /// Estimated until the source reports no further cursor, exact afterwards
    pub total_batch_count: u64,
    pub retry_count: u32,
    pub next_page_cursor: Option<String>,
    pub checkpoints: Vec<Checkpoint>,
    pub last_error: Option<String>,
    #[serde(default = "default_version")]
    pub session_version: u32,
}

fn default_version() -> u32 {
    SESSION_VERSION
}

impl DownloadSession {
    /// Create a fresh session in `initializing` state
    pub fn new(user_identity: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::generate(),
            user_identity: user_identity.into(),
            status: SessionStatus::Initializing,
            created_at: now,
            updated_at: now,
            started_at: None,
            last_checkpoint_at: None,
            completed_at: None,
            total_email_count: 0,
            downloaded_count: 0,
            dispatched_for_vectorization_count: 0,
            failed_email_ids: BTreeSet::new(),
            current_batch_index: 0,
            total_batch_count: 0,
            retry_count: 0,
            next_page_cursor: None,
            checkpoints: Vec::new(),
            last_error: None,
            session_version: SESSION_VERSION,
        }
    }

    /// Apply a mailbox size estimate. Zero leaves the batch count unknown.
    pub fn apply_count_estimate(&mut self, total: u64, page_size: usize) {
        self.total_email_count = total;
        if total > 0 && page_size > 0 {
            self.total_batch_count = total.div_ceil(page_size as u64);
        }
    }

    /// Whether the source has reported its last page
    ///
    /// A session that has not fetched anything yet has no cursor either, so
    /// this also requires at least one completed batch and a fixed batch
    /// count.
    pub fn is_exhausted(&self) -> bool {
        self.current_batch_index > 0
            && self.total_batch_count > 0
            && self.current_batch_index >= self.total_batch_count
            && self.next_page_cursor.is_none()
    }

    /// Account for one successfully fetched batch
    pub fn record_batch(&mut self, received: u64, next_cursor: Option<String>) {
        self.downloaded_count += received;
        self.current_batch_index += 1;
        self.retry_count = 0;
        self.last_error = None;
        self.next_page_cursor = next_cursor;

        if self.next_page_cursor.is_none() {
            self.total_batch_count = self.current_batch_index;
        } else if self.current_batch_index >= self.total_batch_count {
            // Estimate was too low (or unknown); at least one more page exists.
            self.total_batch_count = self.current_batch_index + 1;
        }
    }

    /// Append a checkpoint for the current batch boundary
    pub fn push_checkpoint(&mut self) -> &Checkpoint {
        let now = Utc::now();
        self.last_checkpoint_at = Some(now);
        self.checkpoints.push(Checkpoint {
            batch_index: self.current_batch_index,
            downloaded_count: self.downloaded_count,
            dispatched_count: self.dispatched_for_vectorization_count,
            timestamp: now,
            cursor: self.next_page_cursor.clone(),
        });
        &self.checkpoints[self.checkpoints.len() - 1]
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
