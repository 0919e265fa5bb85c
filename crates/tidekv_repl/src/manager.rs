//! Replication manager: startup, controller scheduling, source changes.

use crate::error::{ReplError, ReplResult};
use crate::net::{BlockingClient, NetworkService, RateLimiter, SESSION_NONE};
use crate::pool::WorkerPool;
use crate::protocol::ReplRequest;
use crate::status::{MPovStatus, RecycleBinlogStatus, SPovStatus};
use chrono::SecondsFormat;
use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tidekv_core::{Catalog, LockMode, ReplState, SegmentMgr, ServerConfig, StoreId, StoreMeta};
use tidekv_storage::{ReplLogEntry, SnapshotChunk, StoreMode, TxnId};
use tracing::{info, warn};

/// Worker count for the replica incremental check pool.
const INCR_CHECK_POOL_SIZE: usize = 2;

/// Controller cadence when nothing was dispatched.
const SCHED_IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Timeout for establishing replication connections.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for single line reads/writes on replication connections.
pub(crate) const IO_TIMEOUT: Duration = Duration::from_secs(1);

/// Entries handed to one incremental fetch or push batch.
pub(crate) const BINLOG_BATCH: usize = 256;

pub(crate) struct ManagerState {
    pub sync_meta: Vec<StoreMeta>,
    pub sync_status: Vec<SPovStatus>,
    pub push_status: Vec<BTreeMap<u64, MPovStatus>>,
    pub log_recyc_status: Vec<RecycleBinlogStatus>,
}

struct Pools {
    full_pusher: WorkerPool,
    incr_pusher: WorkerPool,
    full_receiver: WorkerPool,
    incr_checker: WorkerPool,
    log_recycler: WorkerPool,
}

/// The replication core of one server.
///
/// Owns one replication context per store plus the controller thread that
/// scans them. The owning server holds the manager; the manager only keeps
/// shared handles to its collaborators (catalog, segment manager, network),
/// so there is no cycle in the ownership graph.
pub struct ReplManager {
    cfg: ServerConfig,
    catalog: Arc<dyn Catalog>,
    segment_mgr: Arc<SegmentMgr>,
    network: Arc<dyn NetworkService>,
    rate_limiter: Arc<RateLimiter>,
    dump_path: PathBuf,
    is_running: AtomicBool,
    incr_paused: AtomicBool,
    client_id_gen: AtomicU64,
    pub(crate) state: Mutex<ManagerState>,
    pub(crate) cv: Condvar,
    pools: RwLock<Option<Pools>>,
    controller: Mutex<Option<JoinHandle<()>>>,
}

impl ReplManager {
    /// Creates a manager over the given collaborators. No threads start
    /// until [`ReplManager::startup`].
    pub fn new(
        cfg: ServerConfig,
        catalog: Arc<dyn Catalog>,
        segment_mgr: Arc<SegmentMgr>,
        network: Arc<dyn NetworkService>,
    ) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(cfg.rate_limit_bytes_per_sec));
        let dump_path = cfg.dump_path.clone();
        Self {
            cfg,
            catalog,
            segment_mgr,
            network,
            rate_limiter,
            dump_path,
            is_running: AtomicBool::new(false),
            incr_paused: AtomicBool::new(false),
            client_id_gen: AtomicU64::new(0),
            state: Mutex::new(ManagerState {
                sync_meta: Vec::new(),
                sync_status: Vec::new(),
                push_status: Vec::new(),
                log_recyc_status: Vec::new(),
            }),
            cv: Condvar::new(),
            pools: RwLock::new(None),
            controller: Mutex::new(None),
        }
    }

    /// Loads or synthesizes per-store metadata, starts the five worker
    /// pools, and spawns the controller thread.
    pub fn startup(self: &Arc<Self>) -> ReplResult<()> {
        self.load_state()?;

        let pools = Pools {
            incr_pusher: WorkerPool::new("repl-minc", self.cfg.incr_pool_size)?,
            full_pusher: WorkerPool::new("repl-mfull", self.cfg.max_full_paral)?,
            full_receiver: WorkerPool::new("repl-sfull", self.cfg.max_full_paral)?,
            incr_checker: WorkerPool::new("repl-scheck", INCR_CHECK_POOL_SIZE)?,
            log_recycler: WorkerPool::new("log-recyc", self.cfg.incr_pool_size)?,
        };
        *self.pools.write() = Some(pools);

        self.is_running.store(true, Ordering::Relaxed);
        let mgr = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("repl-ctrl".into())
            .spawn(move || mgr.control_routine())?;
        *self.controller.lock() = Some(handle);
        Ok(())
    }

    /// Loads per-store metadata, sets store modes, and initializes the
    /// runtime status arrays.
    pub(crate) fn load_state(&self) -> ReplResult<()> {
        let store_count = self.cfg.store_count;
        {
            let mut state = self.state.lock();

            for i in 0..store_count as StoreId {
                match self.catalog.get_store_meta(i) {
                    Ok(meta) => state.sync_meta.push(meta),
                    Err(e) if e.is_not_found() => {
                        let meta = StoreMeta::new_default(i);
                        self.catalog.set_store_meta(&meta)?;
                        state.sync_meta.push(meta);
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            for (i, meta) in state.sync_meta.iter().enumerate() {
                if meta.id as usize != i {
                    return Err(ReplError::internal(format!(
                        "meta {i} has id {}",
                        meta.id
                    )));
                }
            }

            for _ in 0..store_count {
                state.sync_status.push(SPovStatus::new());
                state.push_status.push(BTreeMap::new());
            }

            for i in 0..store_count {
                let db = self.segment_mgr.get_db(None, i as StoreId, LockMode::None)?;
                let store = Arc::clone(&db.store);
                if state.sync_meta[i].source_is_empty() {
                    store.set_mode(StoreMode::ReadWrite)?;
                } else {
                    store.set_mode(StoreMode::ReplicateOnly)?;
                }

                let file_seq = self.max_dump_file_seq(i as StoreId)?;
                let mut recyc = RecycleBinlogStatus::new(file_seq);

                let txn = store.create_transaction()?;
                let mut cursor = txn.create_binlog_cursor(TxnId::MIN_VALID)?;
                match cursor.next() {
                    Ok(entry) => recyc.first_binlog_id = entry.txn_id,
                    Err(e) if e.is_exhausted() => recyc.first_binlog_id = TxnId::UNINITED,
                    Err(e) => return Err(e.into()),
                }
                info!("store {i} first binlog id {}", recyc.first_binlog_id);
                state.log_recyc_status.push(recyc);
            }
        }
        Ok(())
    }

    /// Stops the controller and quiesces all five pools.
    pub fn stop(&self) {
        warn!("repl manager begins to stop");
        self.is_running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.controller.lock().take() {
            let _ = handle.join();
        }
        if let Some(mut pools) = self.pools.write().take() {
            pools.full_pusher.stop();
            pools.incr_pusher.stop();
            pools.full_receiver.stop();
            pools.incr_checker.stop();
            pools.log_recycler.stop();
        }
        warn!("repl manager stopped");
    }

    /// True between [`ReplManager::startup`] and [`ReplManager::stop`].
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// The server configuration this manager runs with.
    pub fn config(&self) -> &ServerConfig {
        &self.cfg
    }

    /// The shared bulk-transfer token bucket.
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub(crate) fn segment_mgr(&self) -> &Arc<SegmentMgr> {
        &self.segment_mgr
    }

    pub(crate) fn dump_path(&self) -> &PathBuf {
        &self.dump_path
    }

    fn control_routine(self: Arc<Self>) {
        while self.is_running.load(Ordering::Relaxed) {
            let now = Instant::now();
            let mut did_dispatch = false;
            {
                let pools = self.pools.read();
                if let Some(pools) = pools.as_ref() {
                    let mut state = self.state.lock();
                    did_dispatch = self.sched_slave_in_lock(&mut state, now, pools);
                    did_dispatch =
                        self.sched_master_in_lock(&mut state, now, pools) || did_dispatch;
                    did_dispatch =
                        self.sched_recycle_in_lock(&mut state, now, pools) || did_dispatch;
                }
            }
            if did_dispatch {
                std::thread::yield_now();
            } else {
                std::thread::sleep(SCHED_IDLE_SLEEP);
            }
        }
        info!("repl controller exits");
    }

    fn sched_slave_in_lock(
        self: &Arc<Self>,
        state: &mut ManagerState,
        now: Instant,
        pools: &Pools,
    ) -> bool {
        let mut did_dispatch = false;
        for i in 0..state.sync_status.len() {
            if state.sync_status[i].is_running
                || now < state.sync_status[i].next_sched_time
                || state.sync_meta[i].repl_state == ReplState::None
            {
                continue;
            }
            did_dispatch = true;
            let store_id = i as StoreId;
            match state.sync_meta[i].repl_state {
                ReplState::Connect => {
                    state.sync_status[i].is_running = true;
                    let mgr = Arc::clone(self);
                    pools
                        .full_receiver
                        .schedule(move || mgr.slave_sync_routine(store_id));
                }
                ReplState::Connected => {
                    state.sync_status[i].is_running = true;
                    let mgr = Arc::clone(self);
                    pools
                        .incr_checker
                        .schedule(move || mgr.slave_sync_routine(store_id));
                }
                ReplState::Transfer => {
                    // A worker owns the store for the whole transfer; seeing
                    // this here means the state machine is broken.
                    panic!("sync store {i}: Transfer must not be visible to the scheduler");
                }
                ReplState::None => {}
            }
        }
        did_dispatch
    }

    fn sched_master_in_lock(
        self: &Arc<Self>,
        state: &mut ManagerState,
        now: Instant,
        pools: &Pools,
    ) -> bool {
        if self.incr_paused.load(Ordering::Relaxed) {
            return false;
        }
        let mut did_dispatch = false;
        for i in 0..state.push_status.len() {
            let store_id = i as StoreId;
            for mpov in state.push_status[i].values_mut() {
                if mpov.is_running || now < mpov.next_sched_time {
                    continue;
                }
                did_dispatch = true;
                mpov.is_running = true;
                let client_id = mpov.client_id;
                let mgr = Arc::clone(self);
                pools
                    .incr_pusher
                    .schedule(move || mgr.master_push_routine(store_id, client_id));
            }
        }
        did_dispatch
    }

    fn sched_recycle_in_lock(
        self: &Arc<Self>,
        state: &mut ManagerState,
        now: Instant,
        pools: &Pools,
    ) -> bool {
        let mut did_dispatch = false;
        for i in 0..state.log_recyc_status.len() {
            if state.log_recyc_status[i].is_running || now < state.log_recyc_status[i].next_sched_time
            {
                continue;
            }
            did_dispatch = true;
            let save_logs = state.push_status[i].is_empty();
            let old_first_binlog = state.log_recyc_status[i].first_binlog_id;
            let mut end_log_id = TxnId::UNINITED;
            for mpov in state.push_status[i].values() {
                end_log_id = end_log_id.min(mpov.binlog_pos);
            }
            state.log_recyc_status[i].is_running = true;
            let store_id = i as StoreId;
            let mgr = Arc::clone(self);
            pools.log_recycler.schedule(move || {
                mgr.recycle_binlog(store_id, old_first_binlog, end_log_id, save_logs)
            });
        }
        did_dispatch
    }

    /// Publishes a store meta, optionally persisting it first.
    ///
    /// # Panics
    ///
    /// A persist failure leaves no way to keep memory and disk coherent, so
    /// it aborts the process.
    pub(crate) fn change_repl_state_in_lock(
        &self,
        state: &mut ManagerState,
        meta: StoreMeta,
        persist: bool,
    ) {
        if persist {
            if let Err(e) = self.catalog.set_store_meta(&meta) {
                panic!("set store meta for store {} failed: {e}", meta.id);
            }
        }
        let store_idx = meta.id as usize;
        state.sync_meta[store_idx] = meta;
    }

    /// Publishes a store meta under the manager mutex.
    pub(crate) fn change_repl_state(&self, meta: StoreMeta, persist: bool) {
        let mut state = self.state.lock();
        self.change_repl_state_in_lock(&mut state, meta, persist);
    }

    /// Connects to the meta's source and performs the optional AUTH
    /// handshake.
    pub(crate) fn create_repl_client(
        &self,
        meta: &StoreMeta,
    ) -> ReplResult<Box<dyn BlockingClient>> {
        let mut client = self.network.create_blocking_client(64 * 1024 * 1024);
        if let Err(e) = client.connect(&meta.sync_from_host, meta.sync_from_port, CONNECT_TIMEOUT) {
            warn!(
                "connect {}:{} failed: {e}",
                meta.sync_from_host, meta.sync_from_port
            );
            return Err(e);
        }
        if !self.cfg.masterauth.is_empty() {
            let auth = ReplRequest::Auth {
                password: self.cfg.masterauth.clone(),
            };
            client.write_line(&auth.encode(), IO_TIMEOUT)?;
            let line = client.read_line(IO_TIMEOUT)?;
            if line.is_empty() || line.starts_with('-') {
                info!("full sync auth failed: {line}");
                return Err(ReplError::Auth(line));
            }
        }
        Ok(client)
    }

    /// Changes the replication source of one store.
    ///
    /// Must be called under the server-level exclusive lock. Waits up to one
    /// second for the store's slave worker to go idle so the worker never
    /// observes a mid-flight meta mutation.
    pub fn change_repl_source(
        &self,
        store_id: StoreId,
        ip: &str,
        port: u16,
        source_store_id: u32,
    ) -> ReplResult<()> {
        info!("wait for store {store_id} to yield work");
        let mut state = self.state.lock();
        let idx = store_id as usize;
        if idx >= state.sync_meta.len() {
            return Err(ReplError::internal(format!("invalid store id {store_id}")));
        }

        self.cv.wait_while_for(
            &mut state,
            |s| s.sync_status[idx].is_running,
            Duration::from_secs(1),
        );
        if state.sync_status[idx].is_running {
            return Err(ReplError::timeout("wait for yield failed"));
        }
        info!("wait for store {store_id} to yield work succeeded");

        let db = self.segment_mgr.get_db(None, store_id, LockMode::None)?;
        let store = Arc::clone(&db.store);
        let mut new_meta = state.sync_meta[idx].clone();

        if !ip.is_empty() {
            if !state.sync_meta[idx].source_is_empty() {
                return Err(ReplError::busy(
                    "explicitly set sync source empty before changing it",
                ));
            }
            store.set_mode(StoreMode::ReplicateOnly)?;
            new_meta.sync_from_host = ip.to_string();
            new_meta.sync_from_port = port;
            new_meta.sync_from_id = i64::from(source_store_id);
            new_meta.repl_state = ReplState::Connect;
            new_meta.binlog_id = TxnId::UNINITED;
            info!(
                "change store {store_id} sync source from no one to {}:{}:{}",
                new_meta.sync_from_host, new_meta.sync_from_port, new_meta.sync_from_id
            );
            self.change_repl_state_in_lock(&mut state, new_meta, true);
            return Ok(());
        }

        // ip == "": detach from the current source.
        if new_meta.source_is_empty() {
            return Ok(());
        }
        info!(
            "change store {store_id} sync source {} to no one",
            new_meta.sync_from_host
        );
        let session_id = state.sync_status[idx].session_id;
        if session_id != SESSION_NONE {
            if let Err(e) = self.network.cancel_session(session_id) {
                // Best effort; the worker will observe the dropped client.
                warn!("cancel store {store_id} session failed: {e}");
            }
        }
        state.sync_status[idx].session_id = SESSION_NONE;
        state.sync_status[idx].client = None;

        store.set_mode(StoreMode::ReadWrite)?;
        new_meta.sync_from_host = String::new();
        new_meta.sync_from_port = 0;
        new_meta.sync_from_id = tidekv_core::SYNC_FROM_NONE;
        new_meta.repl_state = ReplState::None;
        new_meta.binlog_id = TxnId::UNINITED;
        self.change_repl_state_in_lock(&mut state, new_meta, true);
        Ok(())
    }

    /// Attaches a downstream replica to one store's binlog stream.
    ///
    /// Called by the command layer after a replica's incremental handshake.
    /// Returns the client id keying the new push context.
    pub fn register_incr_sync(
        &self,
        store_id: StoreId,
        dst_store_id: StoreId,
        client: Box<dyn BlockingClient>,
        binlog_pos: TxnId,
    ) -> ReplResult<u64> {
        let mut state = self.state.lock();
        let idx = store_id as usize;
        if idx >= state.push_status.len() {
            return Err(ReplError::internal(format!("invalid store id {store_id}")));
        }
        let first = state.log_recyc_status[idx].first_binlog_id;
        if !first.is_uninited() && binlog_pos < first {
            return Err(ReplError::busy(format!(
                "requested position {binlog_pos} already truncated, first retained {first}"
            )));
        }
        let client_id = self.client_id_gen.fetch_add(1, Ordering::SeqCst);
        let remote_repr = client.remote_repr();
        state.push_status[idx].insert(
            client_id,
            MPovStatus {
                is_running: false,
                client_id,
                dst_store_id,
                binlog_pos,
                remote_repr,
                client: Some(client),
                next_sched_time: Instant::now(),
            },
        );
        info!("store {store_id} attached downstream client {client_id} at {binlog_pos}");
        Ok(client_id)
    }

    /// Reads up to `limit` binlog entries starting at `from`.
    ///
    /// Returns the entries and the position to continue from. Used by the
    /// master push routine and by the command layer answering incremental
    /// fetches.
    pub fn fetch_binlogs(
        &self,
        store_id: StoreId,
        from: TxnId,
        limit: usize,
    ) -> ReplResult<(Vec<ReplLogEntry>, TxnId)> {
        let db = self
            .segment_mgr
            .get_db(None, store_id, LockMode::IntentionShared)?;
        let store = Arc::clone(&db.store);
        let txn = store.create_transaction()?;
        let mut cursor = txn.create_binlog_cursor(from)?;
        let mut entries = Vec::new();
        let mut next = from;
        while entries.len() < limit {
            match cursor.next() {
                Ok(entry) => {
                    next = entry.txn_id.next();
                    entries.push(entry);
                }
                Err(e) if e.is_exhausted() => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok((entries, next))
    }

    /// Takes a full snapshot of one store for a dump transfer.
    ///
    /// Returns the chunks plus the binlog id the receiving replica should
    /// expect next.
    pub fn full_sync_info(&self, store_id: StoreId) -> ReplResult<(Vec<SnapshotChunk>, TxnId)> {
        let db = self.segment_mgr.get_db(None, store_id, LockMode::Shared)?;
        let (chunks, next) = db.store.snapshot()?;
        Ok((chunks, next))
    }

    /// Runs a full-dump supply job on the full-push pool.
    pub fn schedule_full_push(&self, job: impl FnOnce() + Send + 'static) -> ReplResult<()> {
        match self.pools.read().as_ref() {
            Some(pools) => {
                pools.full_pusher.schedule(job);
                Ok(())
            }
            None => Err(ReplError::internal("manager not started")),
        }
    }

    /// Pauses or resumes incremental pushing to downstreams.
    pub fn pause_incr_sync(&self, paused: bool) {
        self.incr_paused.store(paused, Ordering::Relaxed);
    }

    /// True while incremental pushing is paused.
    pub fn incr_paused(&self) -> bool {
        self.incr_paused.load(Ordering::Relaxed)
    }

    /// Scans `<dump_path>/<store_id>/` for the highest dump file sequence.
    ///
    /// Dump files are named `binlog-<store>-<seq>-<ts>.log`; the third
    /// `-`-delimited field is the sequence. Non-regular files, names not
    /// starting with `binlog`, and unparseable sequences are skipped;
    /// sequences at or above 2^32 are rejected.
    pub(crate) fn max_dump_file_seq(&self, store_id: StoreId) -> ReplResult<u32> {
        let subdir = self.dump_path.join(store_id.to_string());
        fs::create_dir_all(&subdir)?;

        let mut max_seq = 0u32;
        for entry in fs::read_dir(&subdir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                info!("max_dump_file_seq ignores {:?}", entry.path());
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("binlog") {
                info!("max_dump_file_seq ignores {name}");
                continue;
            }
            let seq_field = match name.split('-').nth(2) {
                Some(field) => field,
                None => {
                    warn!("dump file {name} has no sequence field");
                    continue;
                }
            };
            let seq: u64 = match seq_field.parse() {
                Ok(seq) => seq,
                Err(_) => {
                    warn!("parse sequence of dump file {name} failed");
                    continue;
                }
            };
            if seq >= u64::from(u32::MAX) {
                return Err(ReplError::internal(format!("invalid dump file seq {seq}")));
            }
            max_seq = max_seq.max(seq as u32);
        }
        Ok(max_seq)
    }

    /// Operator status, keyed by store id.
    ///
    /// Read under the manager mutex; the output is proportional to the
    /// number of stores and attached clients, never to binlog history.
    pub fn status_json(&self) -> Value {
        let state = self.state.lock();
        let incr_paused = u64::from(self.incr_paused.load(Ordering::Relaxed));
        let mut root = Map::new();
        for (i, meta) in state.sync_meta.iter().enumerate() {
            let mut obj = Map::new();
            obj.insert(
                "first_binlog".to_string(),
                json!(state.log_recyc_status[i].first_binlog_id.as_u64()),
            );
            obj.insert("incr_paused".to_string(), json!(incr_paused));

            let mut dests = Map::new();
            for mpov in state.push_status[i].values() {
                let remote = if mpov.remote_repr.is_empty() {
                    "???"
                } else {
                    mpov.remote_repr.as_str()
                };
                dests.insert(
                    format!("client_{}", mpov.client_id),
                    json!({
                        "is_running": u64::from(mpov.is_running),
                        "dest_store_id": mpov.dst_store_id,
                        "binlog_pos": mpov.binlog_pos.as_u64(),
                        "remote_host": remote,
                    }),
                );
            }
            obj.insert("sync_dest".to_string(), Value::Object(dests));

            obj.insert(
                "sync_source".to_string(),
                json!(format!(
                    "{}:{}:{}",
                    meta.sync_from_host, meta.sync_from_port, meta.sync_from_id
                )),
            );
            obj.insert("binlog_id".to_string(), json!(meta.binlog_id.as_u64()));
            obj.insert("repl_state".to_string(), json!(meta.repl_state.as_u8()));
            obj.insert(
                "last_sync_time".to_string(),
                json!(state.sync_status[i]
                    .last_sync_time
                    .to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
            root.insert(i.to_string(), Value::Object(obj));
        }
        Value::Object(root)
    }

    /// Snapshot of one store's persisted meta.
    pub fn store_meta(&self, store_id: StoreId) -> Option<StoreMeta> {
        self.state
            .lock()
            .sync_meta
            .get(store_id as usize)
            .cloned()
    }

    /// Lowest retained binlog id of one store.
    pub fn first_binlog_id(&self, store_id: StoreId) -> Option<TxnId> {
        self.state
            .lock()
            .log_recyc_status
            .get(store_id as usize)
            .map(|s| s.first_binlog_id)
    }

    /// Client ids of the downstreams attached to one store.
    pub fn push_client_ids(&self, store_id: StoreId) -> Vec<u64> {
        self.state
            .lock()
            .push_status
            .get(store_id as usize)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Next binlog id to send to one downstream.
    pub fn push_binlog_pos(&self, store_id: StoreId, client_id: u64) -> Option<TxnId> {
        self.state
            .lock()
            .push_status
            .get(store_id as usize)
            .and_then(|m| m.get(&client_id))
            .map(|mpov| mpov.binlog_pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ChannelNetwork;
    use std::fs::File;
    use tempfile::tempdir;
    use tidekv_core::{MemCatalog, SYNC_FROM_NONE};
    use tidekv_storage::{MemStore, Store, StoreTransaction};

    struct Fixture {
        mgr: Arc<ReplManager>,
        catalog: Arc<MemCatalog>,
        stores: Vec<Arc<MemStore>>,
        net: ChannelNetwork,
        _dump: tempfile::TempDir,
    }

    fn fixture(store_count: usize) -> Fixture {
        let dump = tempdir().unwrap();
        let cfg = ServerConfig::new(dump.path(), store_count);
        let catalog = Arc::new(MemCatalog::new());
        let stores: Vec<Arc<MemStore>> = (0..store_count).map(|_| Arc::new(MemStore::new())).collect();
        let seg = Arc::new(SegmentMgr::new(
            stores
                .iter()
                .map(|s| Arc::clone(s) as Arc<dyn Store>)
                .collect(),
        ));
        let net = ChannelNetwork::new();
        let mgr = Arc::new(ReplManager::new(
            cfg,
            Arc::clone(&catalog) as Arc<dyn Catalog>,
            seg,
            Arc::new(net.clone()) as Arc<dyn NetworkService>,
        ));
        Fixture {
            mgr,
            catalog,
            stores,
            net,
            _dump: dump,
        }
    }

    fn commit_set(store: &MemStore, key: &[u8], value: &[u8]) -> TxnId {
        let mut txn = store.create_transaction().unwrap();
        txn.set(key, value).unwrap();
        txn.commit().unwrap()
    }

    #[test]
    fn startup_synthesizes_default_metas() {
        let f = fixture(4);
        f.mgr.startup().unwrap();

        assert_eq!(f.catalog.len(), 4);
        for i in 0..4 {
            let meta = f.mgr.store_meta(i).unwrap();
            assert_eq!(meta, StoreMeta::new_default(i));
            assert_eq!(f.stores[i as usize].mode(), StoreMode::ReadWrite);
            assert_eq!(f.mgr.first_binlog_id(i).unwrap(), TxnId::UNINITED);
        }
        assert!(f.mgr.is_running());
        f.mgr.stop();
        assert!(!f.mgr.is_running());
    }

    #[test]
    fn startup_single_store() {
        let f = fixture(1);
        f.mgr.startup().unwrap();
        assert_eq!(f.catalog.len(), 1);
        f.mgr.stop();
    }

    #[test]
    fn load_state_reads_first_binlog_id() {
        let f = fixture(2);
        commit_set(&f.stores[1], b"k", b"v");
        commit_set(&f.stores[1], b"l", b"w");
        f.mgr.load_state().unwrap();
        assert_eq!(f.mgr.first_binlog_id(0).unwrap(), TxnId::UNINITED);
        assert_eq!(f.mgr.first_binlog_id(1).unwrap(), TxnId::new(1));
    }

    #[test]
    fn startup_aborts_on_catalog_error() {
        let f = fixture(2);
        f.catalog.poison_reads();
        assert!(f.mgr.startup().is_err());
    }

    #[test]
    fn load_state_rejects_meta_slot_mismatch() {
        struct SkewedCatalog;
        impl Catalog for SkewedCatalog {
            fn get_store_meta(&self, _id: StoreId) -> tidekv_core::CoreResult<StoreMeta> {
                // Every slot claims to be store 0.
                Ok(StoreMeta::new_default(0))
            }
            fn set_store_meta(&self, _meta: &StoreMeta) -> tidekv_core::CoreResult<()> {
                Ok(())
            }
        }

        let dump = tempdir().unwrap();
        let cfg = ServerConfig::new(dump.path(), 2);
        let stores: Vec<Arc<dyn Store>> = (0..2)
            .map(|_| Arc::new(MemStore::new()) as Arc<dyn Store>)
            .collect();
        let mgr = Arc::new(ReplManager::new(
            cfg,
            Arc::new(SkewedCatalog),
            Arc::new(SegmentMgr::new(stores)),
            Arc::new(ChannelNetwork::new()),
        ));
        assert!(mgr.load_state().is_err());
    }

    #[test]
    fn change_repl_source_sets_connect() {
        let f = fixture(4);
        f.mgr.load_state().unwrap();

        f.mgr.change_repl_source(2, "10.0.0.1", 7000, 5).unwrap();

        let meta = f.mgr.store_meta(2).unwrap();
        assert_eq!(meta.sync_from_host, "10.0.0.1");
        assert_eq!(meta.sync_from_port, 7000);
        assert_eq!(meta.sync_from_id, 5);
        assert_eq!(meta.repl_state, ReplState::Connect);
        assert_eq!(meta.binlog_id, TxnId::UNINITED);
        assert_eq!(f.stores[2].mode(), StoreMode::ReplicateOnly);
        // Persisted through the catalog too.
        assert_eq!(f.catalog.get_store_meta(2).unwrap(), meta);
    }

    #[test]
    fn change_repl_source_busy_when_source_set() {
        let f = fixture(4);
        f.mgr.load_state().unwrap();
        f.mgr.change_repl_source(2, "10.0.0.1", 7000, 5).unwrap();
        let before = f.catalog.get_store_meta(2).unwrap();

        let err = f.mgr.change_repl_source(2, "10.0.0.2", 7000, 5).unwrap_err();
        assert!(err.is_busy());
        assert_eq!(f.catalog.get_store_meta(2).unwrap(), before);
    }

    #[test]
    fn change_repl_source_detach() {
        let f = fixture(2);
        f.mgr.load_state().unwrap();
        f.mgr.change_repl_source(0, "10.0.0.1", 7000, 3).unwrap();

        f.mgr.change_repl_source(0, "", 0, 0).unwrap();
        let meta = f.mgr.store_meta(0).unwrap();
        assert!(meta.source_is_empty());
        assert_eq!(meta.sync_from_id, SYNC_FROM_NONE);
        assert_eq!(meta.repl_state, ReplState::None);
        assert_eq!(f.stores[0].mode(), StoreMode::ReadWrite);

        // Detaching an already-empty source is a no-op.
        f.mgr.change_repl_source(0, "", 0, 0).unwrap();
    }

    #[test]
    fn change_repl_source_invalid_store() {
        let f = fixture(2);
        f.mgr.load_state().unwrap();
        assert!(f.mgr.change_repl_source(9, "10.0.0.1", 7000, 0).is_err());
    }

    #[test]
    fn register_incr_sync_rejects_truncated_position() {
        let f = fixture(1);
        for i in 0..20u8 {
            commit_set(&f.stores[0], &[i], &[i]);
        }
        f.mgr.load_state().unwrap();
        assert_eq!(f.mgr.first_binlog_id(0).unwrap(), TxnId::new(1));

        let client = f.net.create_blocking_client(1024);
        let err = f
            .mgr
            .register_incr_sync(0, 0, client, TxnId::new(0))
            .unwrap_err();
        assert!(err.is_busy());

        let client = f.net.create_blocking_client(1024);
        let id = f
            .mgr
            .register_incr_sync(0, 0, client, TxnId::new(5))
            .unwrap();
        assert_eq!(f.mgr.push_client_ids(0), vec![id]);
        assert_eq!(f.mgr.push_binlog_pos(0, id).unwrap(), TxnId::new(5));
    }

    #[test]
    fn fetch_binlogs_pages_through() {
        let f = fixture(1);
        for i in 0..10u8 {
            commit_set(&f.stores[0], &[i], &[i]);
        }
        let (entries, next) = f.mgr.fetch_binlogs(0, TxnId::new(1), 4).unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(next, TxnId::new(5));
        let (entries, next) = f.mgr.fetch_binlogs(0, next, 100).unwrap();
        assert_eq!(entries.len(), 6);
        assert_eq!(next, TxnId::new(11));
        let (entries, next) = f.mgr.fetch_binlogs(0, next, 100).unwrap();
        assert!(entries.is_empty());
        assert_eq!(next, TxnId::new(11));
    }

    #[test]
    fn max_dump_file_seq_parses_third_field() {
        let f = fixture(1);
        let subdir = f.mgr.dump_path().join("0");
        fs::create_dir_all(&subdir).unwrap();
        for name in [
            "binlog-0-3-100.log",
            "binlog-0-12-200.log",
            "binlog-0-7-300.log",
            "notbinlog-0-99-1.log", // wrong prefix: skipped
            "binlog-weird",         // no sequence field: skipped
            "binlog-0-xyz-1.log",   // unparseable: skipped
        ] {
            File::create(subdir.join(name)).unwrap();
        }
        fs::create_dir_all(subdir.join("binlog-0-50-1.log")).unwrap(); // directory: skipped
        assert_eq!(f.mgr.max_dump_file_seq(0).unwrap(), 12);
    }

    proptest::proptest! {
        #[test]
        fn max_dump_file_seq_is_maximum(
            seqs in proptest::collection::vec(0u32..1_000_000, 0..12),
        ) {
            let f = fixture(1);
            let subdir = f.mgr.dump_path().join("0");
            fs::create_dir_all(&subdir).unwrap();
            for (i, seq) in seqs.iter().enumerate() {
                File::create(subdir.join(format!("binlog-0-{seq}-{i}.log"))).unwrap();
            }
            let expected = seqs.iter().copied().max().unwrap_or(0);
            proptest::prop_assert_eq!(f.mgr.max_dump_file_seq(0).unwrap(), expected);
        }
    }

    #[test]
    fn max_dump_file_seq_creates_missing_directory() {
        let f = fixture(1);
        assert_eq!(f.mgr.max_dump_file_seq(0).unwrap(), 0);
        assert!(f.mgr.dump_path().join("0").is_dir());
    }

    #[test]
    fn max_dump_file_seq_rejects_huge_sequence() {
        let f = fixture(1);
        let subdir = f.mgr.dump_path().join("0");
        fs::create_dir_all(&subdir).unwrap();
        File::create(subdir.join(format!("binlog-0-{}-1.log", u64::from(u32::MAX)))).unwrap();
        assert!(f.mgr.max_dump_file_seq(0).is_err());
    }

    #[test]
    fn status_json_shape() {
        let f = fixture(2);
        commit_set(&f.stores[0], b"k", b"v");
        f.mgr.load_state().unwrap();
        f.mgr.change_repl_source(1, "10.9.9.9", 7001, 4).unwrap();

        let client = f.net.create_blocking_client(1024);
        let id = f
            .mgr
            .register_incr_sync(0, 3, client, TxnId::new(1))
            .unwrap();

        let status = f.mgr.status_json();
        let store0 = &status["0"];
        assert_eq!(store0["first_binlog"], json!(1));
        assert_eq!(store0["repl_state"], json!(0));
        assert_eq!(store0["sync_source"], json!(":0:-1"));
        let dest = &store0["sync_dest"][format!("client_{id}")];
        assert_eq!(dest["is_running"], json!(0));
        assert_eq!(dest["dest_store_id"], json!(3));
        assert_eq!(dest["binlog_pos"], json!(1));
        assert_eq!(dest["remote_host"], json!("???"));

        let store1 = &status["1"];
        assert_eq!(store1["repl_state"], json!(1));
        assert_eq!(store1["sync_source"], json!("10.9.9.9:7001:4"));
        assert_eq!(store1["binlog_id"], json!(TxnId::UNINITED.as_u64()));
        assert!(store1["last_sync_time"].is_string());
    }

    #[test]
    fn pause_incr_sync_is_visible_in_status() {
        let f = fixture(1);
        f.mgr.load_state().unwrap();
        f.mgr.pause_incr_sync(true);
        assert!(f.mgr.incr_paused());
        assert_eq!(f.mgr.status_json()["0"]["incr_paused"], json!(1));
        f.mgr.pause_incr_sync(false);
        assert_eq!(f.mgr.status_json()["0"]["incr_paused"], json!(0));
    }
}
