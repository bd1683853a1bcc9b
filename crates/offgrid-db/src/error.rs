//! Error types for the local store and document CRDT.

use thiserror::Error;

/// Errors that can occur in store or CRDT decode operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Unknown block field: {0}")]
    UnknownField(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
