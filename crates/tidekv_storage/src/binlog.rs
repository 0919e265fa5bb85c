//! Binlog entry types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a committed transaction.
///
/// Transaction ids are monotonically increasing and never reused; they double
/// as binlog sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl TxnId {
    /// Sentinel meaning "no txn id has been established".
    pub const UNINITED: TxnId = TxnId(u64::MAX);

    /// The lowest txn id a committed transaction can carry.
    pub const MIN_VALID: TxnId = TxnId(1);

    /// Creates a new txn id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true if this id is the uninitialized sentinel.
    #[must_use]
    pub const fn is_uninited(self) -> bool {
        self.0 == u64::MAX
    }

    /// Returns the next txn id.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_uninited() {
            write!(f, "txn:uninited")
        } else {
            write!(f, "txn:{}", self.0)
        }
    }
}

/// The mutation kind carried by a binlog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplOp {
    /// Set a key to a value.
    Set,
    /// Delete a key.
    Del,
}

/// One committed mutation in the write-ahead binlog.
///
/// Entries are keyed by their transaction id; a store's binlog holds them in
/// strictly increasing id order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplLogEntry {
    /// Transaction id, doubling as the binlog sequence.
    pub txn_id: TxnId,
    /// Mutation kind.
    pub op: ReplOp,
    /// Affected key.
    pub key: Vec<u8>,
    /// New value; empty for deletes.
    pub value: Vec<u8>,
}

impl ReplLogEntry {
    /// Creates a `Set` entry.
    pub fn set(txn_id: TxnId, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            txn_id,
            op: ReplOp::Set,
            key: key.into(),
            value: value.into(),
        }
    }

    /// Creates a `Del` entry.
    pub fn del(txn_id: TxnId, key: impl Into<Vec<u8>>) -> Self {
        Self {
            txn_id,
            op: ReplOp::Del,
            key: key.into(),
            value: Vec::new(),
        }
    }
}
