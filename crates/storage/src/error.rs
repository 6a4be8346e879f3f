//! Storage error types.

use thiserror::Error;

/// Errors from the durable room store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Redis command or connection error.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A persisted value failed to (de)serialize.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;
