//! Resumable, checkpointed mailbox download
//!
//! One manager owns one session at a time and runs at most one batch fetch
//! at a time. Each pass of the loop:
//!
//! 1. stops if cancel or pause was requested,
//! 2. completes if the source has reported its last page,
//! 3. fetches one batch with the persisted cursor,
//! 4. counts it, hands it to the UI, dispatches every id for vectorization,
//! 5. checkpoints every `checkpoint_interval` batches and persists.
//!
//! A failed fetch is retried with the same cursor after an exponential
//! backoff; once the retry budget is spent the session goes to `error` and
//! can be resumed later.

use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;

use super::control::{DownloadControl, Sleeper, ThreadSleeper};
use crate::config::DownloadOptions;
use crate::error::DownloadError;
use crate::models::{Checkpoint, DownloadSession, SessionId, SessionStatus};
use crate::progress::{DownloadProgress, NoopProgressSink, Notification, ProgressSink};
use crate::source::{EmailBatch, EmailSource};
use crate::storage::SessionStore;
use crate::vectorize::{Dispatcher, VectorizationSink};

/// Collaborators the manager drives
#[derive(Clone)]
pub struct DownloadDeps {
    pub source: Arc<dyn EmailSource>,
    pub sink: Arc<dyn VectorizationSink>,
    pub store: Arc<dyn SessionStore>,
    pub progress: Arc<dyn ProgressSink>,
    pub sleeper: Arc<dyn Sleeper>,
}

impl DownloadDeps {
    /// Dependencies with no progress reporting and real sleeps
    pub fn new(
        source: Arc<dyn EmailSource>,
        sink: Arc<dyn VectorizationSink>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            source,
            sink,
            store,
            progress: Arc::new(NoopProgressSink),
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }
}

/// How a call to `start_download`/`resume_download` ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The source reported its last page
    Completed,
    /// Stopped at a batch boundary on request; resumable
    Paused,
    Cancelled,
    /// The session was already downloading; nothing was done
    AlreadyRunning,
}

/// Owner and driver of one download session
pub struct DownloadManager {
    source: Arc<dyn EmailSource>,
    store: Arc<dyn SessionStore>,
    progress: Arc<dyn ProgressSink>,
    sleeper: Arc<dyn Sleeper>,
    dispatcher: Dispatcher,
    options: DownloadOptions,
    control: DownloadControl,
    session: Option<DownloadSession>,
}

impl DownloadManager {
    /// Create a manager without a session; call [`initialize_download`] next.
    ///
    /// [`initialize_download`]: DownloadManager::initialize_download
    pub fn new(deps: DownloadDeps, options: DownloadOptions) -> Result<Self, DownloadError> {
        let dispatcher = Dispatcher::spawn(deps.sink).map_err(DownloadError::Dispatcher)?;
        Ok(Self {
            source: deps.source,
            store: deps.store,
            progress: deps.progress,
            sleeper: deps.sleeper,
            dispatcher,
            options: options.normalized(),
            control: DownloadControl::new(),
            session: None,
        })
    }

    /// Load a persisted session, e.g. after the process restarted
    ///
    /// A session persisted as `downloading` had its loop killed; no batch can
    /// be in flight any more, so it is brought back as `paused`.
    pub fn restore(
        session_id: &SessionId,
        deps: DownloadDeps,
        options: DownloadOptions,
    ) -> Result<Self, DownloadError> {
        let mut session = deps
            .store
            .get(session_id)
            .map_err(DownloadError::Store)?
            .ok_or_else(|| DownloadError::SessionNotFound(session_id.clone()))?;

        let mut manager = Self::new(deps, options)?;
        if session.status == SessionStatus::Downloading {
            info!("Session {} was interrupted mid-download; marking paused", session.id);
            session.status = SessionStatus::Paused;
            manager.persist(&mut session)?;
        }
        manager.session = Some(session);
        Ok(manager)
    }

    /// Current session snapshot
    pub fn session(&self) -> Option<&DownloadSession> {
        self.session.as_ref()
    }

    /// Handle for pausing or cancelling from another thread
    pub fn control(&self) -> DownloadControl {
        self.control.clone()
    }

    /// Progress snapshot of the current session
    pub fn progress(&self) -> Option<DownloadProgress> {
        self.session
            .as_ref()
            .map(|s| DownloadProgress::from_session(s, status_message(s)))
    }

    /// Create and persist a new session for `user_identity`
    pub fn initialize_download(&mut self, user_identity: &str) -> Result<SessionId, DownloadError> {
        let user_identity = user_identity.trim();
        if user_identity.is_empty() {
            return Err(DownloadError::InvalidUserIdentity);
        }

        let mut session = DownloadSession::new(user_identity);
        self.control.reset();
        self.persist(&mut session)?;
        info!("Initialized download session {} for {}", session.id, user_identity);
        self.report(&session, "Ready to download");

        let id = session.id.clone();
        self.session = Some(session);
        Ok(id)
    }

    /// Start downloading the initialized session
    ///
    /// Blocks until the download completes, pauses, is cancelled or runs
    /// out of retries. Only the last case returns an error.
    pub fn start_download(&mut self) -> Result<DownloadOutcome, DownloadError> {
        let status = self.session.as_ref().ok_or(DownloadError::NoSession)?.status;
        match status {
            SessionStatus::Downloading => {
                info!("Download already in progress");
                return Ok(DownloadOutcome::AlreadyRunning);
            }
            SessionStatus::Completed => {
                info!("Download already completed");
                return Ok(DownloadOutcome::Completed);
            }
            SessionStatus::Cancelled => {
                info!("Download was cancelled; initialize a new session to start over");
                return Ok(DownloadOutcome::Cancelled);
            }
            SessionStatus::Paused | SessionStatus::Error => return self.resume_download(),
            SessionStatus::Initializing => {}
        }

        self.with_session(|manager, session| {
            manager.control.clear_pause();
            transition(session, SessionStatus::Downloading, "start")?;
            session.started_at = Some(Utc::now());
            manager.persist(session)?;
            manager.report(session, "Starting download");

            manager.probe_count(session)?;
            manager.run_batches(session)
        })
    }

    /// Stop after the in-flight batch (if any) and mark the session paused
    ///
    /// From another thread, use [`DownloadControl::pause`] instead; this
    /// method handles the case where no loop is running.
    pub fn pause_download(&mut self) -> Result<(), DownloadError> {
        self.control.pause();
        self.with_session(|manager, session| {
            if session.status == SessionStatus::Paused {
                return Ok(());
            }
            transition(session, SessionStatus::Paused, "pause")?;
            manager.persist(session)?;
            manager.report(session, "Paused");
            Ok(())
        })
    }

    /// Continue a paused or errored session from its persisted cursor
    pub fn resume_download(&mut self) -> Result<DownloadOutcome, DownloadError> {
        self.with_session(|manager, session| {
            if session.status == SessionStatus::Downloading {
                info!("Download already in progress");
                return Ok(DownloadOutcome::AlreadyRunning);
            }
            if !session.status.is_resumable() {
                return Err(DownloadError::InvalidState {
                    operation: "resume",
                    status: session.status,
                });
            }

            manager.control.clear_pause();
            session.retry_count = 0;
            transition(session, SessionStatus::Downloading, "resume")?;
            session.started_at.get_or_insert_with(Utc::now);
            manager.persist(session)?;
            info!(
                "Resuming session {} at batch {}",
                session.id, session.current_batch_index
            );
            manager.report(session, "Resuming download");

            manager.probe_count(session)?;
            manager.run_batches(session)
        })
    }

    /// Cancel the session; no further batches or checkpoints are written
    pub fn cancel_download(&mut self) -> Result<(), DownloadError> {
        self.control.cancel();
        self.with_session(|manager, session| {
            if session.status == SessionStatus::Cancelled {
                return Ok(());
            }
            manager.finish_cancelled(session).map(|_| ())
        })
    }

    /// Append a checkpoint for the current batch boundary and persist it
    ///
    /// The loop calls this on its own every `checkpoint_interval` batches;
    /// calling it directly forces an extra one.
    pub fn create_checkpoint(&mut self) -> Result<Checkpoint, DownloadError> {
        self.with_session(|manager, session| {
            if session.status.is_terminal() {
                return Err(DownloadError::InvalidState {
                    operation: "checkpoint",
                    status: session.status,
                });
            }
            let checkpoint = session.push_checkpoint().clone();
            manager.persist(session)?;
            Ok(checkpoint)
        })
    }

    /// Block until every queued vectorization dispatch has been attempted
    pub fn wait_for_dispatch(&self) {
        self.dispatcher.flush();
    }

    /// Run `f` with the session temporarily moved out of `self`, so helpers
    /// can borrow the manager and the session independently
    fn with_session<T>(
        &mut self,
        f: impl FnOnce(&Self, &mut DownloadSession) -> Result<T, DownloadError>,
    ) -> Result<T, DownloadError> {
        let mut session = self.session.take().ok_or(DownloadError::NoSession)?;
        let result = f(self, &mut session);
        self.session = Some(session);
        result
    }

    /// Best-effort mailbox size probe; failure leaves the total unknown
    fn probe_count(&self, session: &mut DownloadSession) -> Result<(), DownloadError> {
        if session.total_email_count > 0 {
            return Ok(());
        }

        match self.source.count_estimate(&session.user_identity) {
            Ok(total) => {
                session.apply_count_estimate(total, self.options.page_size);
                info!(
                    "Mailbox estimate: {} emails in {} batches",
                    total, session.total_batch_count
                );
                self.persist(session)?;
            }
            Err(e) => warn!("Could not estimate mailbox size, continuing: {:#}", e),
        }
        Ok(())
    }

    fn run_batches(&self, session: &mut DownloadSession) -> Result<DownloadOutcome, DownloadError> {
        let result = self.batch_loop(session);

        if let Err(DownloadError::Store(e)) = &result {
            // The loop stopped without reaching a resting state; leave the
            // in-memory session resumable.
            error!("Stopping download, session could not be saved: {:#}", e);
            if session.status == SessionStatus::Downloading {
                session.status = SessionStatus::Paused;
            }
        }
        result
    }

    fn batch_loop(&self, session: &mut DownloadSession) -> Result<DownloadOutcome, DownloadError> {
        loop {
            if self.control.is_cancel_requested() {
                return self.finish_cancelled(session);
            }
            if self.control.is_pause_requested() {
                return self.finish_paused(session);
            }
            if session.is_exhausted() {
                return self.finish_completed(session);
            }

            let cursor = session.next_page_cursor.clone();
            debug!(
                "Fetching batch {} (cursor {:?})",
                session.current_batch_index + 1,
                cursor
            );

            match self.source.fetch_batch(
                &session.user_identity,
                cursor.as_deref(),
                self.options.page_size,
            ) {
                Ok(batch) => {
                    self.apply_batch(session, batch)?;
                    if session.is_exhausted() {
                        return self.finish_completed(session);
                    }
                    self.sleeper.sleep(self.options.batch_delay());
                }
                Err(e) => {
                    session.retry_count += 1;
                    session.last_error = Some(format!("{:#}", e));

                    if session.retry_count > self.options.max_retries {
                        return self.fail(session);
                    }

                    let delay = self.options.backoff_delay(session.retry_count);
                    warn!(
                        "Batch {} failed (attempt {}/{}), retrying in {:?}: {:#}",
                        session.current_batch_index + 1,
                        session.retry_count,
                        self.options.max_retries,
                        delay,
                        e
                    );
                    self.persist(session)?;
                    self.report(
                        session,
                        format!("Retrying in {}s", delay.as_secs_f64().round()),
                    );
                    self.sleeper.sleep(delay);
                }
            }
        }
    }

    /// Count, show, dispatch and (maybe) checkpoint one successful batch
    fn apply_batch(
        &self,
        session: &mut DownloadSession,
        batch: EmailBatch,
    ) -> Result<(), DownloadError> {
        let EmailBatch {
            emails,
            next_cursor,
            failed_ids,
        } = batch;

        session.record_batch(emails.len() as u64, next_cursor);
        for email in &emails {
            session.failed_email_ids.remove(&email.id);
        }
        session.failed_email_ids.extend(failed_ids);

        self.progress.on_batch(&emails);

        let user = session.user_identity.clone();
        let dispatched = emails
            .iter()
            .filter(|email| self.dispatcher.dispatch(&user, &email.id))
            .count() as u64;
        session.dispatched_for_vectorization_count += dispatched;

        if session.current_batch_index % self.options.checkpoint_interval == 0 {
            let checkpoint = session.push_checkpoint();
            debug!(
                "Checkpoint at batch {} ({} emails)",
                checkpoint.batch_index, checkpoint.downloaded_count
            );
        }

        self.persist(session)?;
        self.report(session, format!("Downloaded batch {}", session.current_batch_index));
        Ok(())
    }

    fn finish_completed(
        &self,
        session: &mut DownloadSession,
    ) -> Result<DownloadOutcome, DownloadError> {
        transition(session, SessionStatus::Completed, "complete")?;
        session.completed_at = Some(Utc::now());
        self.persist(session)?;

        info!(
            "Download {} complete: {} emails, {} dispatched for vectorization",
            session.id, session.downloaded_count, session.dispatched_for_vectorization_count
        );
        self.report(session, "Download complete");
        self.progress.notify(&Notification::completed(session));
        Ok(DownloadOutcome::Completed)
    }

    fn finish_paused(
        &self,
        session: &mut DownloadSession,
    ) -> Result<DownloadOutcome, DownloadError> {
        transition(session, SessionStatus::Paused, "pause")?;
        self.persist(session)?;
        info!(
            "Download {} paused after batch {}",
            session.id, session.current_batch_index
        );
        self.report(session, "Paused");
        Ok(DownloadOutcome::Paused)
    }

    fn finish_cancelled(
        &self,
        session: &mut DownloadSession,
    ) -> Result<DownloadOutcome, DownloadError> {
        transition(session, SessionStatus::Cancelled, "cancel")?;
        self.persist(session)?;
        info!("Download {} cancelled", session.id);
        self.report(session, "Cancelled");
        self.progress.notify(&Notification::info(format!(
            "Download cancelled after {} emails",
            session.downloaded_count
        )));
        Ok(DownloadOutcome::Cancelled)
    }

    /// Retry budget spent: record the error and hand it to the caller once
    fn fail(&self, session: &mut DownloadSession) -> Result<DownloadOutcome, DownloadError> {
        let last_error = session
            .last_error
            .clone()
            .unwrap_or_else(|| "unknown error".to_string());
        error!(
            "Batch {} failed {} times, stopping: {}",
            session.current_batch_index + 1,
            session.retry_count,
            last_error
        );

        transition(session, SessionStatus::Error, "fail")?;
        self.persist(session)?;
        self.report(session, "Download failed");
        self.progress.notify(&Notification::retries_exhausted(session));

        Err(DownloadError::RetriesExhausted {
            attempts: session.retry_count,
            last_error,
        })
    }

    /// Full rewrite of the session under its id
    fn persist(&self, session: &mut DownloadSession) -> Result<(), DownloadError> {
        session.touch();
        self.store.put(session).map_err(DownloadError::Store)
    }

    fn report(&self, session: &DownloadSession, message: impl Into<String>) {
        self.progress
            .update(session.status, &DownloadProgress::from_session(session, message));
    }
}

fn transition(
    session: &mut DownloadSession,
    next: SessionStatus,
    operation: &'static str,
) -> Result<(), DownloadError> {
    if session.status == next {
        return Ok(());
    }
    if !session.status.can_transition_to(next) {
        return Err(DownloadError::InvalidState {
            operation,
            status: session.status,
        });
    }
    debug!("Session {}: {} -> {}", session.id, session.status, next);
    session.status = next;
    Ok(())
}

fn status_message(session: &DownloadSession) -> String {
    match session.status {
        SessionStatus::Initializing => "Ready to download".to_string(),
        SessionStatus::Downloading => {
            format!("Downloading batch {}", session.current_batch_index + 1)
        }
        SessionStatus::Paused => "Paused".to_string(),
        SessionStatus::Completed => "Download complete".to_string(),
        SessionStatus::Cancelled => "Cancelled".to_string(),
        SessionStatus::Error => format!(
            "Failed: {}",
            session.last_error.as_deref().unwrap_or("unknown error")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Email, EmailId};
    use crate::storage::InMemorySessionStore;
    use anyhow::Result;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Source serving `total` numbered emails in pages, failing on request
    struct PagedSource {
        total: usize,
        fail_next: Mutex<u32>,
        count_fails: bool,
    }

    impl PagedSource {
        fn new(total: usize) -> Self {
            Self {
                total,
                fail_next: Mutex::new(0),
                count_fails: false,
            }
        }
    }

    impl EmailSource for PagedSource {
        fn fetch_batch(
            &self,
            _user: &str,
            cursor: Option<&str>,
            page_size: usize,
        ) -> Result<EmailBatch> {
            let mut fail_next = self.fail_next.lock().unwrap();
            if *fail_next > 0 {
                *fail_next -= 1;
                anyhow::bail!("HTTP 503");
            }
            let start: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
            let end = (start + page_size).min(self.total);
            let emails = (start..end)
                .map(|i| Email::builder(format!("m{}", i)).build())
                .collect();
            let next = (end < self.total).then(|| end.to_string());
            Ok(EmailBatch::new(emails, next))
        }

        fn count_estimate(&self, _user: &str) -> Result<u64> {
            if self.count_fails {
                anyhow::bail!("count unavailable");
            }
            Ok(self.total as u64)
        }
    }

    struct NullSink;

    impl VectorizationSink for NullSink {
        fn notify(&self, _user: &str, _email_id: &EmailId) -> Result<()> {
            Ok(())
        }
    }

    struct NoSleep;

    impl Sleeper for NoSleep {
        fn sleep(&self, _duration: Duration) {}
    }

    fn manager(source: PagedSource) -> (DownloadManager, Arc<InMemorySessionStore>) {
        let store = Arc::new(InMemorySessionStore::new());
        let deps = DownloadDeps::new(Arc::new(source), Arc::new(NullSink), store.clone())
            .with_sleeper(Arc::new(NoSleep));
        let manager = DownloadManager::new(deps, DownloadOptions::default()).unwrap();
        (manager, store)
    }

    #[test]
    fn test_initialize_persists_session() {
        let (mut manager, store) = manager(PagedSource::new(0));
        let id = manager.initialize_download("user@example.com").unwrap();

        let stored = store.get(&id).unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Initializing);
        assert_eq!(stored.user_identity, "user@example.com");
    }

    #[test]
    fn test_initialize_rejects_empty_identity() {
        let (mut manager, _) = manager(PagedSource::new(0));
        assert!(matches!(
            manager.initialize_download("  "),
            Err(DownloadError::InvalidUserIdentity)
        ));
    }

    #[test]
    fn test_start_without_session() {
        let (mut manager, _) = manager(PagedSource::new(10));
        assert!(matches!(manager.start_download(), Err(DownloadError::NoSession)));
    }

    #[test]
    fn test_empty_mailbox_completes() {
        let (mut manager, _) = manager(PagedSource::new(0));
        manager.initialize_download("u").unwrap();

        assert_eq!(manager.start_download().unwrap(), DownloadOutcome::Completed);
        let session = manager.session().unwrap();
        assert_eq!(session.downloaded_count, 0);
        assert_eq!(session.total_batch_count, 1);
        assert!(session.completed_at.is_some());
    }

    #[test]
    fn test_count_failure_is_not_fatal() {
        let mut source = PagedSource::new(75);
        source.count_fails = true;
        let (mut manager, _) = manager(source);
        manager.initialize_download("u").unwrap();

        assert_eq!(manager.start_download().unwrap(), DownloadOutcome::Completed);
        let session = manager.session().unwrap();
        assert_eq!(session.total_email_count, 0);
        assert_eq!(session.downloaded_count, 75);
    }

    #[test]
    fn test_start_twice_after_completion() {
        let (mut manager, _) = manager(PagedSource::new(10));
        manager.initialize_download("u").unwrap();
        manager.start_download().unwrap();
        assert_eq!(manager.start_download().unwrap(), DownloadOutcome::Completed);
    }

    #[test]
    fn test_pause_before_start_then_resume() {
        let (mut manager, _) = manager(PagedSource::new(60));
        manager.initialize_download("u").unwrap();
        manager.pause_download().unwrap();
        assert_eq!(manager.session().unwrap().status, SessionStatus::Paused);

        assert_eq!(manager.resume_download().unwrap(), DownloadOutcome::Completed);
        assert_eq!(manager.session().unwrap().downloaded_count, 60);
    }

    #[test]
    fn test_resume_completed_is_invalid() {
        let (mut manager, _) = manager(PagedSource::new(5));
        manager.initialize_download("u").unwrap();
        manager.start_download().unwrap();
        assert!(matches!(
            manager.resume_download(),
            Err(DownloadError::InvalidState { operation: "resume", .. })
        ));
    }

    #[test]
    fn test_cancel_idle_session() {
        let (mut manager, store) = manager(PagedSource::new(5));
        let id = manager.initialize_download("u").unwrap();
        manager.cancel_download().unwrap();

        assert_eq!(store.get(&id).unwrap().unwrap().status, SessionStatus::Cancelled);
        assert_eq!(manager.start_download().unwrap(), DownloadOutcome::Cancelled);
        assert!(manager.create_checkpoint().is_err());
    }

    #[test]
    fn test_forced_checkpoint() {
        let (mut manager, _) = manager(PagedSource::new(120));
        manager.initialize_download("u").unwrap();
        manager.pause_download().unwrap();

        let checkpoint = manager.create_checkpoint().unwrap();
        assert_eq!(checkpoint.batch_index, 0);
        assert_eq!(manager.session().unwrap().checkpoints.len(), 1);
    }

    #[test]
    fn test_failed_ids_are_recorded() {
        struct PartialSource;
        impl EmailSource for PartialSource {
            fn fetch_batch(&self, _: &str, _: Option<&str>, _: usize) -> Result<EmailBatch> {
                Ok(EmailBatch {
                    emails: vec![Email::builder("ok").build()],
                    next_cursor: None,
                    failed_ids: vec![EmailId::new("broken")],
                })
            }
            fn count_estimate(&self, _: &str) -> Result<u64> {
                Ok(0)
            }
        }

        let store = Arc::new(InMemorySessionStore::new());
        let deps = DownloadDeps::new(Arc::new(PartialSource), Arc::new(NullSink), store)
            .with_sleeper(Arc::new(NoSleep));
        let mut manager = DownloadManager::new(deps, DownloadOptions::default()).unwrap();
        manager.initialize_download("u").unwrap();
        manager.start_download().unwrap();

        let session = manager.session().unwrap();
        assert_eq!(session.downloaded_count, 1);
        assert!(session.failed_email_ids.contains(&EmailId::new("broken")));
    }

    #[test]
    fn test_progress_snapshot() {
        let (mut manager, _) = manager(PagedSource::new(100));
        assert!(manager.progress().is_none());
        manager.initialize_download("u").unwrap();
        manager.start_download().unwrap();

        let progress = manager.progress().unwrap();
        assert_eq!(progress.downloaded, 100);
        assert_eq!(progress.dispatched, 100);
        assert_eq!(progress.message, "Download complete");
    }

    #[test]
    fn test_single_failure_then_success() {
        let source = PagedSource::new(30);
        *source.fail_next.lock().unwrap() = 1;
        let (mut manager, _) = manager(source);
        manager.initialize_download("u").unwrap();

        assert_eq!(manager.start_download().unwrap(), DownloadOutcome::Completed);
        let session = manager.session().unwrap();
        assert_eq!(session.retry_count, 0);
        assert!(session.last_error.is_none());
        assert_eq!(session.downloaded_count, 30);
    }
}
