//! Error types for the storage wrapper.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in the storage wrapper.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error while preparing the environment directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the underlying B-tree engine.
    #[error("engine error: {0}")]
    Engine(#[from] redb::Error),

    /// A key exceeded the engine's maximum key length.
    #[error("key is {len} bytes, maximum is {max}")]
    KeyTooLarge {
        /// Actual key length.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },
}

impl From<redb::DatabaseError> for StorageError {
    fn from(e: redb::DatabaseError) -> Self {
        Self::Engine(e.into())
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Engine(e.into())
    }
}

impl From<redb::TableError> for StorageError {
    fn from(e: redb::TableError) -> Self {
        Self::Engine(e.into())
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(e: redb::StorageError) -> Self {
        Self::Engine(e.into())
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(e: redb::CommitError) -> Self {
        Self::Engine(e.into())
    }
}
