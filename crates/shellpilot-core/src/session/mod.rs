//! Long-lived shell sessions.
//!
//! A session wraps one shell process that survives across many tool calls.
//! Its output is drained continuously into an [`OutputLog`] by background
//! threads; tool handlers read that log by index and never touch the pipes.

mod drain;
mod log;
mod registry;
mod state;

use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

pub use self::log::{LogEntry, OutputLog, Stream};
pub use registry::SessionRegistry;
pub use state::{BusyGuard, MarkerWait, PendingCommand, SessionId, SessionSnapshot, ShellSession};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid session id: {0}")]
    InvalidId(String),

    #[error("Failed to start shell: {0}")]
    Spawn(String),

    #[error("Shell session {0} is not running")]
    NotAlive(SessionId),

    #[error("Failed to write to shell session {session_id}: {source}")]
    Write {
        session_id: SessionId,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid working directory: {0}")]
    WorkingDir(String),
}

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
