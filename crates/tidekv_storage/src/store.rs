//! Store engine traits.
//!
//! The replication core treats each store as an **opaque KV engine**. These
//! traits are the full contract it relies on: transactions, binlog cursors,
//! truncation, replication apply, and snapshot transfer. Production deploys
//! back them with a persistent engine; tests substitute [`crate::MemStore`].

use crate::binlog::{ReplLogEntry, TxnId};
use crate::error::StorageResult;
use serde::{Deserialize, Serialize};

/// Operating mode of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Normal operation: the store accepts client writes.
    ReadWrite,
    /// The store only accepts mutations applied by the replication core.
    ReplicateOnly,
}

/// One key/value pair of a full-dump snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotChunk {
    /// Key bytes.
    pub key: Vec<u8>,
    /// Value bytes.
    pub value: Vec<u8>,
}

/// A per-store KV engine.
///
/// # Invariants
///
/// - Committed transaction ids are strictly increasing per store
/// - The binlog holds every committed mutation until truncated
/// - `truncate_binlog` only removes entries handed out by `get_truncate_log`
pub trait Store: Send + Sync {
    /// Opens a new transaction on this store.
    fn create_transaction(&self) -> StorageResult<Box<dyn StoreTransaction>>;

    /// Switches the store's operating mode.
    fn set_mode(&self, mode: StoreMode) -> StorageResult<()>;

    /// Returns the store's current operating mode.
    fn mode(&self) -> StoreMode;

    /// Computes the truncatable binlog range `[start, end)`.
    ///
    /// Returns the new retention floor and the entries to remove, bounded by
    /// the engine's batch limit. When nothing is truncatable the returned
    /// floor equals `start` and the entry list is empty.
    fn get_truncate_log(
        &self,
        start: TxnId,
        end: TxnId,
        txn: &dyn StoreTransaction,
    ) -> StorageResult<(TxnId, Vec<ReplLogEntry>)>;

    /// Removes the given entries from the binlog.
    fn truncate_binlog(
        &self,
        entries: &[ReplLogEntry],
        txn: &dyn StoreTransaction,
    ) -> StorageResult<()>;

    /// Applies one replicated mutation, preserving its original txn id.
    ///
    /// Used by the slave sync path; the entry lands in this store's binlog
    /// under the same id so the store can itself be replicated from.
    fn apply_repl_log(&self, entry: &ReplLogEntry, txn: &dyn StoreTransaction)
        -> StorageResult<()>;

    /// Takes a full snapshot of the keyspace.
    ///
    /// Returns the snapshot chunks together with the binlog id the receiving
    /// replica should expect next.
    fn snapshot(&self) -> StorageResult<(Vec<SnapshotChunk>, TxnId)>;

    /// Loads one snapshot chunk during a full-dump transfer.
    fn load_snapshot_chunk(&self, chunk: &SnapshotChunk) -> StorageResult<()>;

    /// Returns the highest committed binlog id, or [`TxnId::UNINITED`] when
    /// the binlog is empty.
    fn highest_binlog_id(&self) -> TxnId;
}

/// A transaction on one store.
///
/// Transactions are owned exclusively by the worker or session that created
/// them; they are not shared across threads.
pub trait StoreTransaction: Send {
    /// Commits the transaction, returning the assigned txn id.
    fn commit(&mut self) -> StorageResult<TxnId>;

    /// Rolls the transaction back.
    fn rollback(&mut self) -> StorageResult<()>;

    /// Stages a `Set` mutation.
    fn set(&mut self, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Stages a `Del` mutation.
    fn del(&mut self, key: &[u8]) -> StorageResult<()>;

    /// Opens a binlog cursor positioned at the first entry with
    /// `txn_id >= min_txn_id`.
    fn create_binlog_cursor(&self, min_txn_id: TxnId) -> StorageResult<Box<dyn BinlogCursor>>;
}

/// Iterator over a store's binlog.
pub trait BinlogCursor: Send {
    /// Returns the next entry, or [`crate::StorageError::Exhausted`] at end.
    fn next(&mut self) -> StorageResult<ReplLogEntry>;
}
