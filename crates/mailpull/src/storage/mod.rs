//! Session persistence
//!
//! The download manager rewrites the whole session after every mutation.
//! Backends only need last-writer-wins put/get keyed by session id.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemorySessionStore;
pub use sqlite::SqliteSessionStore;
pub use traits::SessionStore;
