//! Error types for the replication core.

use std::io;
use thiserror::Error;

/// Result type for replication operations.
pub type ReplResult<T> = Result<T, ReplError>;

/// Errors that can occur in the replication core.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Storage engine error, passed through unchanged.
    #[error("storage error: {0}")]
    Storage(#[from] tidekv_storage::StorageError),

    /// Core/catalog error, passed through unchanged.
    #[error("core error: {0}")]
    Core(#[from] tidekv_core::CoreError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A bounded wait expired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The operation conflicts with current state.
    #[error("busy: {0}")]
    Busy(String),

    /// Transport failure.
    #[error("network error: {0}")]
    Net(String),

    /// Malformed wire frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Master rejected authentication.
    #[error("auth failed: {0}")]
    Auth(String),

    /// Internal error indicating a bug or impossible state.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReplError {
    /// Creates a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    /// Creates a busy error.
    pub fn busy(message: impl Into<String>) -> Self {
        Self::Busy(message.into())
    }

    /// Creates a network error.
    pub fn net(message: impl Into<String>) -> Self {
        Self::Net(message.into())
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true for the bounded-wait expiry kind.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Returns true for the state-conflict kind.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_markers() {
        assert!(ReplError::timeout("wait for yield failed").is_timeout());
        assert!(ReplError::busy("source already set").is_busy());
        assert!(!ReplError::internal("boom").is_timeout());
    }
}
