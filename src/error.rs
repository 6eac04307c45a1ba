//! Error types for queuectl.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Duplicate(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("job {job} is no longer held by worker {pid}")]
    ClaimLost { job: String, pid: u32 },

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Caller mistakes: nothing was mutated and retrying the same call will fail again.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::Duplicate(_)
                | Error::Validation(_)
                | Error::InvalidTransition { .. }
                | Error::ClaimLost { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
