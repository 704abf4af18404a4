//! Transfer engine seams
//!
//! The multi never performs network I/O itself. It drives two collaborators:
//!
//! - [`TransferSession`] - one engine session, exclusively owned by a handle
//! - [`Multiplexer`] - polls many sessions at once and reports finished ones
//!
//! [`memory`] provides an in-process engine used by tests and the demo CLI.

pub mod memory;

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Opaque identifier the multiplexer uses to watch a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(pub u64);

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Result code reported by the transfer itself. `0` means no error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransferCode(pub i64);

/// Result code reported by the multiplexer for one session. `0` means no error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MultiCode(pub i64);

impl TransferCode {
    pub const OK: TransferCode = TransferCode(0);

    pub fn is_ok(&self) -> bool {
        self.0 == 0
    }
}

impl MultiCode {
    pub const OK: MultiCode = MultiCode(0);

    pub fn is_ok(&self) -> bool {
        self.0 == 0
    }
}

/// A session the multiplexer reported as finished, with its multiplexer-level code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finished {
    pub key: SessionKey,
    pub code: MultiCode,
}

/// Errors raised by the multiplexer itself, not tied to one transfer outcome
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MultiplexerError {
    #[error("Multiplexer resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Session not recognized by multiplexer: {0}")]
    UnknownSession(SessionKey),

    #[error("Multiplexer poll failed: {0}")]
    Poll(String),
}

/// One underlying engine session
pub trait TransferSession: Send + 'static {
    /// Stable key used to present this session to the multiplexer
    fn key(&self) -> SessionKey;

    /// Result of the transfer as reported by the engine
    fn transfer_code(&self) -> TransferCode;
}

/// Polls many sessions for completion in a single call
///
/// Implementations synchronize internally. A [`Multi`](crate::multi::Multi)
/// edits the watch set from any thread while another thread is blocked in
/// [`poll_once`](Multiplexer::poll_once), so `add_session` and
/// `remove_session` must never wait for a poll to return.
pub trait Multiplexer: Send + Sync + 'static {
    type Session: TransferSession;

    fn add_session(&self, session: &Self::Session) -> Result<(), MultiplexerError>;

    /// Stop watching `key`. A finished but not yet reported session must not
    /// be reported by any later `poll_once`.
    fn remove_session(&self, key: SessionKey) -> Result<(), MultiplexerError>;

    /// Wait for finished sessions.
    ///
    /// `Some(Duration::ZERO)` must not block, `Some(t)` blocks for at most `t`,
    /// `None` blocks until something finishes or [`wakeup`](Multiplexer::wakeup)
    /// is called. Sessions are returned in the order they finished.
    fn poll_once(&self, timeout: Option<Duration>) -> Result<Vec<Finished>, MultiplexerError>;

    /// Make a blocked (or the next) `poll_once` return early, possibly empty
    fn wakeup(&self);
}
