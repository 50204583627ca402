//! Cooperative pause/cancel signalling and delay abstraction

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Cloneable handle for stopping a running download from another thread
///
/// Requests are only observed between batches; an in-flight fetch is never
/// interrupted.
#[derive(Debug, Clone, Default)]
pub struct DownloadControl {
    pause: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
}

impl DownloadControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to stop after the current batch and mark the session paused
    pub fn pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    /// Ask the loop to stop after the current batch and mark the session cancelled
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_pause(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    pub(crate) fn reset(&self) {
        self.pause.store(false, Ordering::SeqCst);
        self.cancel.store(false, Ordering::SeqCst);
    }
}

/// Blocking delay used for the inter-batch courtesy pause and retry backoff
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the current thread
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}
