//! Download orchestration
//!
//! [`DownloadManager`] drives one [`DownloadSession`](crate::models::DownloadSession)
//! through its lifecycle:
//!
//! ```text
//! initializing -> downloading -> completed
//!                    |   ^
//!                    v   |
//!                 paused / error      (any non-terminal) -> cancelled
//! ```
//!
//! Pause and cancel are cooperative: a [`DownloadControl`] cloned from the
//! manager can be flipped from any thread, and the loop honours it at the
//! next batch boundary.

mod control;
mod manager;

pub use control::{DownloadControl, Sleeper, ThreadSleeper};
pub use manager::{DownloadDeps, DownloadManager, DownloadOutcome};
