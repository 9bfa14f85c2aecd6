// Persistence Store
// The only source of truth for state that must survive process restart

mod store;

pub use store::{FinishOutcome, JobStore, NewTask};

use thiserror::Error;

/// Store failure classes. `Unavailable` is the only kind callers may retry.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Transient storage failure (lock contention, I/O); retryable
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The requested write is not admissible in the current state
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The task was already claimed by another worker
    #[error("already claimed: {0}")]
    AlreadyClaimed(String),

    /// A stored row failed to deserialize
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(err.to_string()),
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                rusqlite::ErrorCode::DatabaseBusy
                | rusqlite::ErrorCode::DatabaseLocked
                | rusqlite::ErrorCode::SystemIoFailure
                | rusqlite::ErrorCode::DiskFull => StoreError::Unavailable(err.to_string()),
                rusqlite::ErrorCode::ConstraintViolation => StoreError::Conflict(err.to_string()),
                rusqlite::ErrorCode::DatabaseCorrupt => StoreError::Corrupt(err.to_string()),
                _ => StoreError::Unavailable(err.to_string()),
            },
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
