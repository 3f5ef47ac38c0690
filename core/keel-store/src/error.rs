//! Error types for the storage layer.

use rusqlite::ffi;
use thiserror::Error;

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(rusqlite::Error),

    /// A unique or primary-key constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Row not found.
    #[error("row not found: {0}")]
    NotFound(String),

    /// A previous holder of the connection lock panicked.
    #[error("connection lock poisoned")]
    Poisoned,

    /// Stored data could not be decoded, or a write was missing data.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, message) = &err {
            if matches!(
                code.extended_code,
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            ) {
                return StoreError::Conflict(
                    message.clone().unwrap_or_else(|| code.to_string()),
                );
            }
        }
        StoreError::Database(err)
    }
}
