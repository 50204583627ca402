//! In-memory session store
//!
//! Used by tests and by callers that do not need durability across restarts.

use anyhow::Result;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::RwLock;

use super::SessionStore;
use crate::models::{DownloadSession, SessionId};

/// In-memory implementation of SessionStore
///
/// Sessions are stored as cloned snapshots, so callers never share mutable
/// state with the store.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, DownloadSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions
    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for InMemorySessionStore {
    fn put(&self, session: &DownloadSession) -> Result<()> {
        let mut sessions = self.sessions.write().unwrap();
        sessions.insert(session.id.0.clone(), session.clone());
        Ok(())
    }

    fn get(&self, id: &SessionId) -> Result<Option<DownloadSession>> {
        let sessions = self.sessions.read().unwrap();
        Ok(sessions.get(id.as_str()).cloned())
    }

    fn latest_for_user(&self, user_identity: &str) -> Result<Option<DownloadSession>> {
        let sessions = self.sessions.read().unwrap();
        Ok(sessions
            .values()
            .filter(|s| s.user_identity == user_identity && !s.status.is_terminal())
            .max_by_key(|s| s.updated_at)
            .cloned())
    }

    fn list(&self) -> Result<Vec<DownloadSession>> {
        let sessions = self.sessions.read().unwrap();
        let mut all: Vec<_> = sessions.values().cloned().collect();
        all.sort_by_key(|s| Reverse(s.updated_at));
        Ok(all)
    }

    fn delete(&self, id: &SessionId) -> Result<()> {
        self.sessions.write().unwrap().remove(id.as_str());
        Ok(())
    }
}
