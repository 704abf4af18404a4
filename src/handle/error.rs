use crate::multi::MultiId;
use thiserror::Error;

/// Contract violations detected by a handle
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum HandleError {
    #[error("Handle is already registered with multi {owner}")]
    AlreadyRegistered { owner: MultiId },

    #[error("Handle already completed; reset it before registering again")]
    AlreadyCompleted,

    #[error("Handle completed twice in one registration cycle")]
    DoubleCompletion,

    #[error("Handle is not registered with multi {multi}")]
    NotRegistered { multi: MultiId },

    #[error("Handle is still registered with multi {owner}")]
    StillRegistered { owner: MultiId },
}

pub type Result<T> = std::result::Result<T, HandleError>;
