//! Store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("WRONGTYPE operation against key {0} holding the wrong kind of value")]
    WrongType(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl From<StoreError> for buildgate_core::Error {
    fn from(e: StoreError) -> Self {
        buildgate_core::Error::Store(e.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
