//! Error types for TideKV core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage engine error.
    #[error("storage error: {0}")]
    Storage(#[from] tidekv_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Catalog entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Catalog codec error.
    #[error("catalog codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Another process holds the catalog directory.
    #[error("catalog locked: another process has exclusive access")]
    CatalogLocked,

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the argument issue.
        message: String,
    },

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Creates a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Creates an invalid-argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this is the not-found marker.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
