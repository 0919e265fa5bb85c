//! Error types for the storage layer.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A binlog cursor has no more entries.
    #[error("binlog cursor exhausted")]
    Exhausted,

    /// The store is busy and cannot serve the request right now.
    #[error("store busy: {0}")]
    Busy(String),

    /// The transaction is no longer usable.
    #[error("transaction not active: {reason}")]
    TransactionNotActive {
        /// Why the transaction cannot be used.
        reason: String,
    },

    /// I/O error from the underlying medium.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal engine error.
    #[error("internal storage error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Creates a busy error.
    pub fn busy(message: impl Into<String>) -> Self {
        Self::Busy(message.into())
    }

    /// Returns true if this error is the cursor-end marker.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted)
    }
}
