//! Domain models for mailbox downloads

mod email;
mod session;

pub use email::{Email, EmailAddress, EmailBuilder, EmailId};
pub use session::{Checkpoint, DownloadSession, SessionId, SessionStatus};
