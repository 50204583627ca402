//! Mailpull - resumable, checkpointed mailbox downloads
//!
//! This crate downloads a user's whole mailbox in batches through a provider
//! API, persists progress after every batch so a download survives restarts
//! and failures, and hands each downloaded email id to a vectorization sink.
//!
//! - Domain models (DownloadSession, Checkpoint, Email)
//! - Gmail and Microsoft Graph email sources
//! - Session store abstraction with SQLite and in-memory backends
//! - Download manager with pause/resume/cancel and retry backoff
//! - Fire-and-forget vectorization dispatch
//!
//! Everything is synchronous; callers that need concurrency run the manager
//! on their own thread and signal it through [`DownloadControl`].

pub mod config;
pub mod download;
pub mod error;
pub mod models;
pub mod progress;
pub mod source;
pub mod storage;
pub mod vectorize;

pub use self::config::{DownloadOptions, VectorizeConfig};
pub use download::{
    DownloadControl, DownloadDeps, DownloadManager, DownloadOutcome, Sleeper, ThreadSleeper,
};
pub use error::{DownloadError, StatusError};
pub use models::{
    Checkpoint, DownloadSession, Email, EmailAddress, EmailId, SessionId, SessionStatus,
};
pub use progress::{
    DownloadProgress, LogProgressSink, NoopProgressSink, Notification, NotificationLevel,
    ProgressSink,
};
pub use source::{EmailBatch, EmailSource, GmailSource, GraphSource, StaticToken, TokenProvider};
pub use storage::{InMemorySessionStore, SessionStore, SqliteSessionStore};
pub use vectorize::{Dispatcher, HttpVectorizationSink, IdempotentSink, VectorizationSink};
