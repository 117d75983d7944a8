//! Error types module
//!
//! `QueueError` covers every failure the queue engine can observe outside of
//! user handlers: storage, serialization and configuration errors.
//!
//! The `Database` variant and `From<sqlx::Error>` are gated behind the `sqlx` feature.

#[cfg(feature = "sqlx")]
use sqlx::Error as SqlxError;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[source] SqlxError),

    /// Storage failure reported by a non-SQL backend.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(feature = "sqlx")]
impl From<SqlxError> for QueueError {
    fn from(err: SqlxError) -> Self {
        QueueError::Database(err)
    }
}

impl QueueError {
    /// Storage failures are retried on the next poll cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            #[cfg(feature = "sqlx")]
            QueueError::Database(_) => true,
            QueueError::Storage(_) => true,
            _ => false,
        }
    }
}

pub type QueueResult<T> = Result<T, QueueError>;
