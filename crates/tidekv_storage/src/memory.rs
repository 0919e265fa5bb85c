//! In-memory store engine.

use crate::binlog::{ReplLogEntry, ReplOp, TxnId};
use crate::error::{StorageError, StorageResult};
use crate::store::{BinlogCursor, SnapshotChunk, Store, StoreMode, StoreTransaction};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Upper bound on entries returned by one `get_truncate_log` call.
const TRUNCATE_BATCH: usize = 1024;

#[derive(Debug)]
struct MemInner {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    binlog: BTreeMap<u64, ReplLogEntry>,
    next_txn_id: u64,
    mode: StoreMode,
}

/// An in-memory KV engine with a binlog.
///
/// Every mutation receives its own binlog id at commit time; ids keep
/// increasing across truncation, so the binlog can be empty while the id
/// counter is far ahead.
#[derive(Debug)]
pub struct MemStore {
    inner: Arc<RwLock<MemInner>>,
}

impl MemStore {
    /// Creates an empty store in read-write mode.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemInner {
                data: BTreeMap::new(),
                binlog: BTreeMap::new(),
                next_txn_id: TxnId::MIN_VALID.as_u64(),
                mode: StoreMode::ReadWrite,
            })),
        }
    }

    /// Returns the value stored under `key`, if any.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.read().data.get(key).cloned()
    }

    /// Returns the number of entries currently retained in the binlog.
    pub fn binlog_len(&self) -> usize {
        self.inner.read().binlog.len()
    }

    /// Returns the lowest retained binlog id, or [`TxnId::UNINITED`].
    pub fn first_binlog_id(&self) -> TxnId {
        self.inner
            .read()
            .binlog
            .keys()
            .next()
            .map(|&id| TxnId::new(id))
            .unwrap_or(TxnId::UNINITED)
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemStore {
    fn create_transaction(&self) -> StorageResult<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemTransaction {
            inner: Arc::clone(&self.inner),
            writes: Vec::new(),
            active: true,
        }))
    }

    fn set_mode(&self, mode: StoreMode) -> StorageResult<()> {
        self.inner.write().mode = mode;
        Ok(())
    }

    fn mode(&self) -> StoreMode {
        self.inner.read().mode
    }

    fn get_truncate_log(
        &self,
        start: TxnId,
        end: TxnId,
        _txn: &dyn StoreTransaction,
    ) -> StorageResult<(TxnId, Vec<ReplLogEntry>)> {
        let inner = self.inner.read();
        let floor = if start.is_uninited() {
            TxnId::MIN_VALID.as_u64()
        } else {
            start.as_u64()
        };
        if floor >= end.as_u64() {
            return Ok((start, Vec::new()));
        }
        let entries: Vec<ReplLogEntry> = inner
            .binlog
            .range(floor..end.as_u64())
            .take(TRUNCATE_BATCH)
            .map(|(_, e)| e.clone())
            .collect();
        match entries.last() {
            Some(last) => Ok((last.txn_id.next(), entries)),
            None => Ok((start, entries)),
        }
    }

    fn truncate_binlog(
        &self,
        entries: &[ReplLogEntry],
        _txn: &dyn StoreTransaction,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write();
        for entry in entries {
            if inner.binlog.remove(&entry.txn_id.as_u64()).is_none() {
                return Err(StorageError::internal(format!(
                    "truncate of absent binlog id {}",
                    entry.txn_id
                )));
            }
        }
        Ok(())
    }

    fn apply_repl_log(
        &self,
        entry: &ReplLogEntry,
        _txn: &dyn StoreTransaction,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write();
        match entry.op {
            ReplOp::Set => {
                inner.data.insert(entry.key.clone(), entry.value.clone());
            }
            ReplOp::Del => {
                inner.data.remove(&entry.key);
            }
        }
        // The entry keeps its upstream id so this store can itself be a
        // replication source.
        inner.binlog.insert(entry.txn_id.as_u64(), entry.clone());
        if entry.txn_id.as_u64() >= inner.next_txn_id {
            inner.next_txn_id = entry.txn_id.as_u64() + 1;
        }
        Ok(())
    }

    fn snapshot(&self) -> StorageResult<(Vec<SnapshotChunk>, TxnId)> {
        let inner = self.inner.read();
        let chunks = inner
            .data
            .iter()
            .map(|(k, v)| SnapshotChunk {
                key: k.clone(),
                value: v.clone(),
            })
            .collect();
        Ok((chunks, TxnId::new(inner.next_txn_id)))
    }

    fn load_snapshot_chunk(&self, chunk: &SnapshotChunk) -> StorageResult<()> {
        self.inner
            .write()
            .data
            .insert(chunk.key.clone(), chunk.value.clone());
        Ok(())
    }

    fn highest_binlog_id(&self) -> TxnId {
        self.inner
            .read()
            .binlog
            .keys()
            .next_back()
            .map(|&id| TxnId::new(id))
            .unwrap_or(TxnId::UNINITED)
    }
}

enum PendingWrite {
    Set { key: Vec<u8>, value: Vec<u8> },
    Del { key: Vec<u8> },
}

struct MemTransaction {
    inner: Arc<RwLock<MemInner>>,
    writes: Vec<PendingWrite>,
    active: bool,
}

impl MemTransaction {
    fn check_active(&self) -> StorageResult<()> {
        if self.active {
            Ok(())
        } else {
            Err(StorageError::TransactionNotActive {
                reason: "already committed or rolled back".into(),
            })
        }
    }
}

impl StoreTransaction for MemTransaction {
    fn commit(&mut self) -> StorageResult<TxnId> {
        self.check_active()?;
        self.active = false;
        if self.writes.is_empty() {
            return Ok(TxnId::UNINITED);
        }
        let mut inner = self.inner.write();
        let mut last = TxnId::UNINITED;
        for write in self.writes.drain(..) {
            let id = inner.next_txn_id;
            inner.next_txn_id += 1;
            let entry = match write {
                PendingWrite::Set { key, value } => {
                    inner.data.insert(key.clone(), value.clone());
                    ReplLogEntry::set(TxnId::new(id), key, value)
                }
                PendingWrite::Del { key } => {
                    inner.data.remove(&key);
                    ReplLogEntry::del(TxnId::new(id), key)
                }
            };
            inner.binlog.insert(id, entry);
            last = TxnId::new(id);
        }
        Ok(last)
    }

    fn rollback(&mut self) -> StorageResult<()> {
        self.check_active()?;
        self.active = false;
        self.writes.clear();
        Ok(())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.check_active()?;
        if self.inner.read().mode != StoreMode::ReadWrite {
            return Err(StorageError::busy("store is replicate-only"));
        }
        self.writes.push(PendingWrite::Set {
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    fn del(&mut self, key: &[u8]) -> StorageResult<()> {
        self.check_active()?;
        if self.inner.read().mode != StoreMode::ReadWrite {
            return Err(StorageError::busy("store is replicate-only"));
        }
        self.writes.push(PendingWrite::Del { key: key.to_vec() });
        Ok(())
    }

    fn create_binlog_cursor(&self, min_txn_id: TxnId) -> StorageResult<Box<dyn BinlogCursor>> {
        let floor = if min_txn_id.is_uninited() {
            TxnId::MIN_VALID.as_u64()
        } else {
            min_txn_id.as_u64()
        };
        let entries: Vec<ReplLogEntry> = self
            .inner
            .read()
            .binlog
            .range(floor..)
            .map(|(_, e)| e.clone())
            .collect();
        Ok(Box::new(MemBinlogCursor { entries, pos: 0 }))
    }
}

struct MemBinlogCursor {
    entries: Vec<ReplLogEntry>,
    pos: usize,
}

impl BinlogCursor for MemBinlogCursor {
    fn next(&mut self) -> StorageResult<ReplLogEntry> {
        match self.entries.get(self.pos) {
            Some(entry) => {
                self.pos += 1;
                Ok(entry.clone())
            }
            None => Err(StorageError::Exhausted),
        }
    }
}
