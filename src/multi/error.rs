use crate::engine::{MultiplexerError, SessionKey};
use crate::handle::{HandleError, HandleId};
use crate::multi::MultiId;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MultiError {
    #[error("Handle {handle} is already registered with another multi ({owner})")]
    RegistrationConflict { handle: HandleId, owner: MultiId },

    #[error("Handle {handle} is already registered with this multi")]
    AlreadyRegistered { handle: HandleId },

    #[error("Session {session} is already active in this multi")]
    DuplicateSession { session: SessionKey },

    #[error("Active handle limit reached ({limit})")]
    CapacityExhausted { limit: usize },

    #[error("Multi is shutting down or destroyed")]
    ShutDown,

    #[error("Handle contract violation: {0}")]
    Handle(#[from] HandleError),

    #[error("Multiplexer error: {0}")]
    Multiplexer(#[from] MultiplexerError),
}

pub type Result<T> = std::result::Result<T, MultiError>;
