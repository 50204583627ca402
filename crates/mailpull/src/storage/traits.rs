//! Storage trait definitions

use crate::models::{DownloadSession, SessionId};
use anyhow::Result;

/// Key-value store for download sessions
///
/// Every `put` is a full overwrite of the session under its id. No
/// transactional guarantees are required beyond last-writer-wins.
pub trait SessionStore: Send + Sync {
    /// Insert or replace a session
    fn put(&self, session: &DownloadSession) -> Result<()>;

    /// Get a session by ID
    fn get(&self, id: &SessionId) -> Result<Option<DownloadSession>>;

    /// Most recently updated session for a user that is not completed or
    /// cancelled, used to pick a download back up after a restart
    fn latest_for_user(&self, user_identity: &str) -> Result<Option<DownloadSession>>;

    /// All sessions, most recently updated first
    fn list(&self) -> Result<Vec<DownloadSession>>;

    /// Delete a session
    fn delete(&self, id: &SessionId) -> Result<()>;
}
