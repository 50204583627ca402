//! Email sources: paginated access to a user's mailbox
//!
//! The download manager only needs two calls from a provider: fetch one page
//! by cursor, and estimate the mailbox size. Gmail and Microsoft Graph
//! implementations live in submodules; both authenticate through a
//! [`TokenProvider`] so token acquisition and refresh stay outside this crate.

mod gmail;
mod graph;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::StatusError;
use crate::models::{Email, EmailId};

pub use gmail::{GmailSource, api as gmail_api};
pub use graph::{GraphSource, api as graph_api};

/// One page of emails returned by a source
#[derive(Debug, Clone, Default)]
pub struct EmailBatch {
    /// Emails in the order the provider returned them. May be empty even when
    /// `next_cursor` is present.
    pub emails: Vec<Email>,
    /// Opaque cursor for the next page, `None` once the mailbox is exhausted
    pub next_cursor: Option<String>,
    /// Ids listed on this page whose details could not be fetched
    pub failed_ids: Vec<EmailId>,
}

impl EmailBatch {
    pub fn new(emails: Vec<Email>, next_cursor: Option<String>) -> Self {
        Self {
            emails,
            next_cursor,
            failed_ids: Vec::new(),
        }
    }
}

/// Paginated mailbox access
///
/// The source is the only authority on pagination position; the manager
/// passes back whatever cursor it last received.
pub trait EmailSource: Send + Sync {
    /// Fetch one page starting at `cursor` (`None` = first page)
    fn fetch_batch(&self, user: &str, cursor: Option<&str>, page_size: usize)
    -> Result<EmailBatch>;

    /// Best-effort mailbox size; 0 means unknown
    fn count_estimate(&self, user: &str) -> Result<u64>;
}

/// Supplies bearer tokens for provider APIs
pub trait TokenProvider: Send + Sync {
    fn access_token(&self) -> Result<String>;
}

/// A fixed, externally obtained access token
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenProvider for StaticToken {
    fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Run `op` up to `attempts` times with doubling delay plus jitter
///
/// Used for per-message detail fetches inside a single batch; batch-level
/// retry is the download manager's job.
pub(crate) fn with_retry<T>(attempts: u32, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut delay = Duration::from_millis(100);
    let mut attempt = 1;

    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                log::debug!("Attempt {} failed, retrying: {:#}", attempt, e);
                std::thread::sleep(delay + Duration::from_millis(rand_jitter()));
                delay *= 2;
                attempt += 1;
            }
        }
    }
}

/// GET a provider endpoint with a bearer token and decode the JSON body
///
/// Non-2xx responses become a [`StatusError`] so callers can inspect the code.
pub(crate) fn get_json<T: DeserializeOwned>(
    service: &'static str,
    url: &str,
    token: &str,
    extra_headers: &[(&str, &str)],
) -> Result<T> {
    let mut request = ureq::get(url).header("Authorization", &format!("Bearer {}", token));
    for (name, value) in extra_headers {
        request = request.header(*name, *value);
    }

    match request.call() {
        Ok(mut response) => response
            .body_mut()
            .read_json()
            .with_context(|| format!("Failed to parse {} response", service)),
        Err(ureq::Error::StatusCode(status)) => Err(StatusError { service, status }.into()),
        Err(e) => Err(anyhow::Error::new(e).context(format!("{} request failed", service))),
    }
}

/// Generate a random jitter value (0-100ms)
fn rand_jitter() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish() % 100
}
