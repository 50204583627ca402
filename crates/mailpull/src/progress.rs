//! Progress reporting towards the UI layer
//!
//! The manager pushes status text, fetched emails and notifications into a
//! [`ProgressSink`]. Nothing pushed here is ever read back by the manager.

use log::{error, info, warn};

use crate::models::{DownloadSession, Email, SessionStatus};

/// Point-in-time view of a session's progress
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub dispatched: u64,
    /// 0 when the mailbox size is unknown
    pub total: u64,
    pub batch_index: u64,
    pub total_batches: u64,
    pub retry_count: u32,
    /// Human-readable status line
    pub message: String,
}

impl DownloadProgress {
    pub fn from_session(session: &DownloadSession, message: impl Into<String>) -> Self {
        Self {
            downloaded: session.downloaded_count,
            dispatched: session.dispatched_for_vectorization_count,
            total: session.total_email_count,
            batch_index: session.current_batch_index,
            total_batches: session.total_batch_count,
            retry_count: session.retry_count,
            message: message.into(),
        }
    }

    /// Percentage of the estimated total, if one is known
    pub fn percent(&self) -> Option<f64> {
        (self.total > 0)
            .then(|| (self.downloaded as f64 / self.total as f64 * 100.0).min(100.0))
    }

    /// Short counts line, e.g. `120/500 emails (24%)`
    pub fn summary(&self) -> String {
        match self.percent() {
            Some(pct) => format!("{}/{} emails ({:.0}%)", self.downloaded, self.total, pct),
            None => format!("{} emails", self.downloaded),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Success,
    Error,
}

/// A user-facing notification
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    /// Stays on screen until dismissed
    pub persistent: bool,
    /// Whether the UI should offer a "resume" action
    pub can_resume: bool,
}

impl Notification {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Info,
            message: message.into(),
            persistent: false,
            can_resume: false,
        }
    }

    /// Final success message including how many emails went to vectorization
    pub fn completed(session: &DownloadSession) -> Self {
        Self {
            level: NotificationLevel::Success,
            message: format!(
                "Download complete: {} emails downloaded, {} sent for vectorization",
                session.downloaded_count, session.dispatched_for_vectorization_count
            ),
            persistent: false,
            can_resume: false,
        }
    }

    /// Raised once the retry budget for a batch is spent
    pub fn retries_exhausted(session: &DownloadSession) -> Self {
        let reason = session.last_error.as_deref().unwrap_or("unknown error");
        Self {
            level: NotificationLevel::Error,
            message: format!(
                "Download stopped after repeated failures ({}). \
                 The {} emails downloaded so far are saved; retry to continue.",
                reason, session.downloaded_count
            ),
            persistent: true,
            can_resume: true,
        }
    }
}

/// Receiver of progress updates; purely observational
pub trait ProgressSink: Send + Sync {
    /// Status line changed
    fn update(&self, status: SessionStatus, progress: &DownloadProgress);

    /// A batch of emails was fetched and should be appended to the list view
    fn on_batch(&self, _emails: &[Email]) {}

    /// Show a notification to the user
    fn notify(&self, notification: &Notification);
}

/// Sink that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn update(&self, _status: SessionStatus, _progress: &DownloadProgress) {}

    fn notify(&self, _notification: &Notification) {}
}

/// Sink that writes progress to the `log` facade
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgressSink;

impl ProgressSink for LogProgressSink {
    fn update(&self, status: SessionStatus, progress: &DownloadProgress) {
        info!("[{}] {} - {}", status, progress.summary(), progress.message);
    }

    fn on_batch(&self, emails: &[Email]) {
        for email in emails {
            log::debug!("Fetched {} {:?}", email.id, email.subject);
        }
    }

    fn notify(&self, notification: &Notification) {
        match notification.level {
            NotificationLevel::Error => error!("{}", notification.message),
            NotificationLevel::Success | NotificationLevel::Info => {
                if notification.persistent {
                    warn!("{}", notification.message);
                } else {
                    info!("{}", notification.message);
                }
            }
        }
    }
}
