//! Key store error types.

use thiserror::Error;

/// Errors from the API key store.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// An active key already exists for the project.
    #[error("project '{0}' already has an active API key")]
    ActiveKeyExists(String),

    /// A stored row could not be decoded.
    #[error("corrupt api_keys row: {0}")]
    Decode(String),

    /// Underlying SQL error.
    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, KeyStoreError>;
