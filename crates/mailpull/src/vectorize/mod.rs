//! Vectorization dispatch
//!
//! Every downloaded email id is handed to a [`VectorizationSink`] for
//! downstream processing. Dispatch is fire-and-forget: the [`Dispatcher`]
//! runs sink calls on a detached worker thread and only logs failures.

mod dispatcher;
mod http;

use anyhow::Result;
use std::collections::HashSet;
use std::sync::Mutex;

use crate::models::EmailId;

pub use dispatcher::Dispatcher;
pub use http::HttpVectorizationSink;

/// Receives "email ready for processing" notifications
pub trait VectorizationSink: Send + Sync {
    fn notify(&self, user: &str, email_id: &EmailId) -> Result<()>;
}

/// Wraps a sink so each (user, email id) pair is forwarded at most once
/// successfully.
///
/// Retried or resumed batches can deliver the same id twice; this keeps the
/// downstream side from processing duplicates. A failed forward is forgotten
/// so a later dispatch of the same id gets another chance.
pub struct IdempotentSink<S> {
    inner: S,
    seen: Mutex<HashSet<(String, EmailId)>>,
}

impl<S: VectorizationSink> IdempotentSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Number of distinct ids forwarded so far
    pub fn forwarded(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl<S: VectorizationSink> VectorizationSink for IdempotentSink<S> {
    fn notify(&self, user: &str, email_id: &EmailId) -> Result<()> {
        let key = (user.to_string(), email_id.clone());
        if !self.seen.lock().unwrap().insert(key.clone()) {
            log::debug!("Skipping duplicate vectorization for {}", email_id);
            return Ok(());
        }

        let result = self.inner.notify(user, email_id);
        if result.is_err() {
            self.seen.lock().unwrap().remove(&key);
        }
        result
    }
}
