//! Per-session transaction and lock ledger.
//!
//! A single command may touch multiple stores; each store has its own
//! transaction system, and the session is the natural coordinator. The
//! ledger tracks at most one open transaction per store, the lock handles
//! the session currently holds, and the per-key lock map used to detect
//! same-session re-entry.
//!
//! All mutating operations serialize on the session's own mutex. That mutex
//! is orthogonal to the replication manager's mutex and must never be held
//! while acquiring it (or vice versa).

use crate::error::{CoreError, CoreResult};
use crate::lock::{LockMode, SessionLock};
use crate::StoreId;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tidekv_storage::{Store, StoreTransaction};
use tracing::error;

/// Sentinel for an unset extend-protocol timestamp.
pub const TSEP_UNINITED: i64 = -1;
/// Sentinel for an unset extend-protocol version.
pub const VERSIONEP_UNINITED: i64 = -1;

/// Cap on the retained command-argument brief.
const ARGS_BRIEF_MAX: usize = 8;

struct SessionInner {
    txns: BTreeMap<StoreId, Box<dyn StoreTransaction>>,
    locks: Vec<Arc<dyn SessionLock>>,
    keylocks: HashMap<String, LockMode>,
    args_brief: Vec<String>,
    wait_store: StoreId,
    wait_key: String,
    wait_mode: LockMode,
    timestamp: i64,
    version: i64,
}

/// Per-session ledger of open transactions, held locks, and request state.
pub struct SessionCtx {
    inner: Mutex<SessionInner>,
    authed: AtomicBool,
    db_id: AtomicU32,
    repl_only: AtomicBool,
    is_monitor: AtomicBool,
    extend_protocol: AtomicBool,
    process_packet_start: AtomicU64,
}

impl SessionCtx {
    /// Creates an empty session ledger.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                txns: BTreeMap::new(),
                locks: Vec::new(),
                keylocks: HashMap::new(),
                args_brief: Vec::new(),
                wait_store: 0,
                wait_key: String::new(),
                wait_mode: LockMode::None,
                timestamp: TSEP_UNINITED,
                version: VERSIONEP_UNINITED,
            }),
            authed: AtomicBool::new(false),
            db_id: AtomicU32::new(0),
            repl_only: AtomicBool::new(false),
            is_monitor: AtomicBool::new(false),
            extend_protocol: AtomicBool::new(false),
            process_packet_start: AtomicU64::new(0),
        }
    }

    /// Ensures the session has an open transaction on `store`.
    ///
    /// Idempotent within a session: a second call for the same store reuses
    /// the existing transaction. Fails with the store's error if creation
    /// fails.
    pub fn create_transaction(&self, store_id: StoreId, store: &dyn Store) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.txns.contains_key(&store_id) {
            return Ok(());
        }
        let txn = store.create_transaction()?;
        inner.txns.insert(store_id, txn);
        Ok(())
    }

    /// Runs `f` against the session's transaction on `store`, creating it
    /// first if absent.
    pub fn with_transaction<R>(
        &self,
        store_id: StoreId,
        store: &dyn Store,
        f: impl FnOnce(&mut dyn StoreTransaction) -> CoreResult<R>,
    ) -> CoreResult<R> {
        let mut inner = self.inner.lock();
        if !inner.txns.contains_key(&store_id) {
            let txn = store.create_transaction()?;
            inner.txns.insert(store_id, txn);
        }
        let txn = inner
            .txns
            .get_mut(&store_id)
            .expect("transaction inserted above");
        f(txn.as_mut())
    }

    /// Number of transactions currently open on this session.
    pub fn open_transaction_count(&self) -> usize {
        self.inner.lock().txns.len()
    }

    /// Commits every open transaction.
    ///
    /// Cross-store atomicity is deliberately not provided: a failed commit is
    /// recorded and the remaining stores are still committed, so a partial
    /// success is possible. The transaction map is cleared regardless of the
    /// outcome; the returned error is the last failure observed.
    pub fn commit_all(&self, cmd: &str) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        let txns = std::mem::take(&mut inner.txns);
        let mut last_err: Option<CoreError> = None;
        for (store_id, mut txn) in txns {
            if let Err(e) = txn.commit() {
                error!("{cmd} commit error at store {store_id}, leads to partial success: {e}");
                last_err = Some(e.into());
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Rolls back every open transaction.
    ///
    /// Symmetric to [`SessionCtx::commit_all`]: continues on failure and
    /// always clears the map.
    pub fn rollback_all(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        let txns = std::mem::take(&mut inner.txns);
        let mut last_err: Option<CoreError> = None;
        for (store_id, mut txn) in txns {
            if let Err(e) = txn.rollback() {
                error!("rollback error at store {store_id}, may lead to partial success: {e}");
                last_err = Some(e.into());
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Registers a held lock handle.
    pub fn add_lock(&self, lock: Arc<dyn SessionLock>) {
        self.inner.lock().locks.push(lock);
    }

    /// Unregisters a held lock handle, compared by identity.
    ///
    /// # Panics
    ///
    /// Removing a handle that was never added is an invariant violation.
    pub fn remove_lock(&self, lock: &Arc<dyn SessionLock>) {
        let mut inner = self.inner.lock();
        match inner.locks.iter().position(|l| Arc::ptr_eq(l, lock)) {
            Some(pos) => {
                inner.locks.remove(pos);
            }
            None => panic!("remove of a lock this session does not hold"),
        }
    }

    /// Snapshot of the held locks as `(store, key, mode)` tuples.
    pub fn lock_states(&self) -> Vec<(StoreId, String, LockMode)> {
        self.inner
            .lock()
            .locks
            .iter()
            .map(|l| (l.store_id(), l.key().to_string(), l.mode()))
            .collect()
    }

    /// Records that this session holds `key` at `mode`.
    pub fn set_keylock(&self, key: impl Into<String>, mode: LockMode) {
        self.inner.lock().keylocks.insert(key.into(), mode);
    }

    /// Clears the session's record for `key`.
    ///
    /// # Panics
    ///
    /// Unsetting a key the session does not hold is an invariant violation.
    pub fn unset_keylock(&self, key: &str) {
        if self.inner.lock().keylocks.remove(key).is_none() {
            panic!("unset of key lock {key:?} this session does not hold");
        }
    }

    /// Returns true if this session already holds `key`.
    ///
    /// # Panics
    ///
    /// Re-entry is only permitted at an equal-or-weaker mode; asking for a
    /// stronger mode than held is an upgrade, which is disallowed within one
    /// session.
    pub fn is_locked_by_me(&self, key: &str, mode: LockMode) -> bool {
        let inner = self.inner.lock();
        match inner.keylocks.get(key) {
            Some(&held) => {
                assert!(
                    mode <= held,
                    "key lock upgrade within one session: {key:?} held {held:?}, asked {mode:?}"
                );
                true
            }
            None => false,
        }
    }

    /// Stores at most the first eight arguments for operator status dumps.
    pub fn set_args_brief(&self, v: &[String]) {
        let mut inner = self.inner.lock();
        inner.args_brief = v.iter().take(ARGS_BRIEF_MAX).cloned().collect();
    }

    /// The retained argument brief.
    pub fn args_brief(&self) -> Vec<String> {
        self.inner.lock().args_brief.clone()
    }

    /// Records what this session is currently blocked on.
    pub fn set_wait_lock(&self, store_id: StoreId, key: impl Into<String>, mode: LockMode) {
        let mut inner = self.inner.lock();
        inner.wait_store = store_id;
        inner.wait_key = key.into();
        inner.wait_mode = mode;
    }

    /// The current wait descriptor.
    pub fn waitlock(&self) -> (StoreId, String, LockMode) {
        let inner = self.inner.lock();
        (inner.wait_store, inner.wait_key.clone(), inner.wait_mode)
    }

    /// Resets per-request state: open transactions, the argument brief, and
    /// the extend-protocol values.
    pub fn clear_request_ctx(&self) {
        let mut inner = self.inner.lock();
        inner.txns.clear();
        inner.args_brief.clear();
        inner.timestamp = TSEP_UNINITED;
        inner.version = VERSIONEP_UNINITED;
    }

    /// True once the session has authenticated.
    pub fn authed(&self) -> bool {
        self.authed.load(Ordering::Relaxed)
    }

    /// Marks the session authenticated.
    pub fn set_authed(&self) {
        self.authed.store(true, Ordering::Relaxed);
    }

    /// The session's selected logical db.
    pub fn db_id(&self) -> u32 {
        self.db_id.load(Ordering::Relaxed)
    }

    /// Selects the session's logical db.
    pub fn set_db_id(&self, db_id: u32) {
        self.db_id.store(db_id, Ordering::Relaxed);
    }

    /// True if the session only accepts replication traffic.
    pub fn repl_only(&self) -> bool {
        self.repl_only.load(Ordering::Relaxed)
    }

    /// Marks the session replication-only.
    pub fn set_repl_only(&self, v: bool) {
        self.repl_only.store(v, Ordering::Relaxed);
    }

    /// True if the session is a monitor.
    pub fn is_monitor(&self) -> bool {
        self.is_monitor.load(Ordering::Relaxed)
    }

    /// Marks the session as a monitor.
    pub fn set_is_monitor(&self, v: bool) {
        self.is_monitor.store(v, Ordering::Relaxed);
    }

    /// True if the session negotiated the extended protocol.
    pub fn extend_protocol(&self) -> bool {
        self.extend_protocol.load(Ordering::Relaxed)
    }

    /// Sets the extended-protocol flag.
    pub fn set_extend_protocol(&self, v: bool) {
        self.extend_protocol.store(v, Ordering::Relaxed);
    }

    /// Sets the extended-protocol `(timestamp, version)` pair.
    pub fn set_extend_protocol_value(&self, timestamp: i64, version: i64) {
        let mut inner = self.inner.lock();
        inner.timestamp = timestamp;
        inner.version = version;
    }

    /// The extended-protocol `(timestamp, version)` pair.
    pub fn extend_protocol_value(&self) -> (i64, i64) {
        let inner = self.inner.lock();
        (inner.timestamp, inner.version)
    }

    /// Wall-clock start of the packet being processed, microseconds.
    pub fn process_packet_start(&self) -> u64 {
        self.process_packet_start.load(Ordering::Relaxed)
    }

    /// Records the start of packet processing.
    pub fn set_process_packet_start(&self, start: u64) {
        self.process_packet_start.store(start, Ordering::Relaxed);
    }
}

impl Default for SessionCtx {
    fn default() -> Self {
        Self::new()
    }
}
