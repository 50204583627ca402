//! Error types surfaced by the download manager

use crate::models::{SessionId, SessionStatus};

/// Errors returned from `DownloadManager` operations
///
/// Transient batch failures, count-probe failures and dispatch failures are
/// absorbed by the manager and never show up here.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("User identity must not be empty")]
    InvalidUserIdentity,

    #[error("Cannot {operation} a session in state '{status}'")]
    InvalidState {
        operation: &'static str,
        status: SessionStatus,
    },

    #[error("No download session has been initialized")]
    NoSession,

    #[error("Download session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Failed to start vectorization dispatcher: {0:#}")]
    Dispatcher(anyhow::Error),

    #[error("Batch failed {attempts} times, giving up: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Session store error: {0:#}")]
    Store(anyhow::Error),
}

/// Non-success HTTP status from a provider API
#[derive(Debug, thiserror::Error)]
#[error("{service} returned HTTP {status}")]
pub struct StatusError {
    pub service: &'static str,
    pub status: u16,
}

impl StatusError {
    /// 429 and 5xx are worth retrying
    pub fn is_transient(&self) -> bool {
        self.status == 429 || self.status >= 500
    }
}
