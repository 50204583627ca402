//! Detached dispatch worker
//!
//! The download loop must never wait on the vectorization sink. Jobs go
//! through a channel to one background thread, which calls the sink in the
//! order jobs were queued and logs any failure.

use anyhow::{Context, Result};
use log::{debug, warn};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use super::VectorizationSink;
use crate::models::EmailId;

enum Job {
    Notify { user: String, email_id: EmailId },
    /// Acknowledged once every job queued before it has been attempted
    Flush(Sender<()>),
}

/// Owner of the background dispatch thread
///
/// Dropping the dispatcher closes the queue and waits for the worker to
/// finish the jobs already queued.
pub struct Dispatcher {
    tx: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Start the worker thread for `sink`
    pub fn spawn(sink: Arc<dyn VectorizationSink>) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("vectorize-dispatch".to_string())
            .spawn(move || run_worker(sink, rx))
            .context("Failed to spawn vectorization dispatch thread")?;

        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    /// Queue a notification without waiting for it.
    ///
    /// Returns `false` if the worker is gone and the job could not be queued.
    pub fn dispatch(&self, user: &str, email_id: &EmailId) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        let job = Job::Notify {
            user: user.to_string(),
            email_id: email_id.clone(),
        };
        if tx.send(job).is_err() {
            warn!("Vectorization worker stopped; dropping {}", email_id);
            return false;
        }
        true
    }

    /// Block until every job queued so far has been attempted
    pub fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (ack_tx, ack_rx) = mpsc::channel();
        if tx.send(Job::Flush(ack_tx)).is_ok() {
            // A dead worker drops the ack sender, which unblocks recv.
            let _ = ack_rx.recv();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("Vectorization worker panicked");
        }
    }
}

fn run_worker(sink: Arc<dyn VectorizationSink>, rx: Receiver<Job>) {
    for job in rx {
        match job {
            Job::Notify { user, email_id } => match sink.notify(&user, &email_id) {
                Ok(()) => debug!("Queued {} for vectorization", email_id),
                Err(e) => warn!("Vectorization dispatch failed for {}: {:#}", email_id, e),
            },
            Job::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}
