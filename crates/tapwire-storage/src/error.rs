//! Storage error types.

use std::time::Duration;

use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database error from rusqlite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (e.g., creating directories).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The writer lock could not be acquired in time.
    #[error("Timed out after {0:?} waiting for the database lock")]
    LockTimeout(Duration),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A write kept failing after every retry attempt.
    #[error("Store unavailable after {attempts} attempts: {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Busy/locked databases, I/O failures, a full disk and lock timeouts are
    /// transient. Constraint violations and malformed data are not.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::LockTimeout(_) | StorageError::Io(_) => true,
            StorageError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DiskFull
                    | ErrorCode::CannotOpen
            ),
            _ => false,
        }
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
