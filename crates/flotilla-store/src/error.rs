//! Error types for the object store.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store transactions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    Exists(String),

    #[error("name already in use: {0}")]
    NameConflict(String),

    #[error("update out of sequence for {id}: have version {have}, stored {stored}")]
    StaleVersion { id: String, have: u64, stored: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("proposal rejected: {0}")]
    Proposal(String),

    #[error("store is closed")]
    Closed,
}
