//! Slave-side sync routine.
//!
//! Runs on the full-receive pool (state `Connect`) or the incremental check
//! pool (state `Connected`), always outside the manager mutex. All failures
//! are converted into backoff; the per-store state machine recovers on the
//! next scheduler tick.

use crate::error::{ReplError, ReplResult};
use crate::manager::{ReplManager, BINLOG_BATCH, CONNECT_TIMEOUT, IO_TIMEOUT};
use crate::net::{BlockingClient, SESSION_NONE};
use crate::protocol::{self, ReplRequest};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tidekv_core::{LockMode, ReplState, StoreId, StoreMeta};
use tidekv_storage::TxnId;
use tracing::{info, warn};

/// Minimum backoff after a failed sync step.
const FAILURE_BACKOFF: Duration = Duration::from_secs(1);

/// Poll delay when the master had nothing new.
const IDLE_POLL_DELAY: Duration = Duration::from_millis(50);

/// Restores the slave status when the routine exits, however it exits.
struct SlaveReleaseGuard<'a> {
    mgr: &'a ReplManager,
    store_id: StoreId,
    next_sched: Instant,
    synced: bool,
    client: Option<Box<dyn BlockingClient>>,
    session_id: u64,
}

impl Drop for SlaveReleaseGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.mgr.state.lock();
        let status = &mut state.sync_status[self.store_id as usize];
        assert!(status.is_running, "slave release without running flag");
        status.is_running = false;
        status.next_sched_time = self.next_sched;
        status.client = self.client.take();
        status.session_id = self.session_id;
        if self.synced {
            status.last_sync_time = Utc::now();
        }
        self.mgr.cv.notify_all();
    }
}

impl ReplManager {
    /// Drives one store's slave state machine one step forward.
    pub(crate) fn slave_sync_routine(&self, store_id: StoreId) {
        let (meta, taken_client) = {
            let mut state = self.state.lock();
            let idx = store_id as usize;
            let meta = state.sync_meta[idx].clone();
            let client = state.sync_status[idx].client.take();
            (meta, client)
        };

        let mut guard = SlaveReleaseGuard {
            mgr: self,
            store_id,
            next_sched: Instant::now() + FAILURE_BACKOFF,
            synced: false,
            client: None,
            session_id: SESSION_NONE,
        };

        match meta.repl_state {
            ReplState::Connect => {
                drop(taken_client);
                match self.slave_full_sync(&meta) {
                    Ok(()) => {
                        guard.synced = true;
                        guard.next_sched = Instant::now();
                    }
                    Err(e) => {
                        warn!("store {store_id} full sync failed: {e}");
                    }
                }
            }
            ReplState::Connected => match self.slave_catchup(&meta, taken_client) {
                Ok((client, got_data)) => {
                    guard.synced = true;
                    guard.next_sched = if got_data {
                        Instant::now()
                    } else {
                        Instant::now() + IDLE_POLL_DELAY
                    };
                    guard.session_id = client.session_id();
                    guard.client = Some(client);
                }
                Err(e) => {
                    warn!("store {store_id} incremental sync failed: {e}");
                }
            },
            other => {
                panic!("slave routine dispatched for store {store_id} in state {other:?}");
            }
        }
    }

    /// Full dump: connect, request, apply, publish `Connected`.
    ///
    /// The state passes through `Transfer` only while the worker owns the
    /// store; the scheduler never observes it because the running flag is
    /// held for the whole routine.
    fn slave_full_sync(&self, meta: &StoreMeta) -> ReplResult<()> {
        let mut transfer = meta.clone();
        transfer.repl_state = ReplState::Transfer;
        self.change_repl_state(transfer, false);

        match self.slave_full_sync_inner(meta) {
            Ok(next_binlog) => {
                let mut done = meta.clone();
                done.repl_state = ReplState::Connected;
                done.binlog_id = next_binlog;
                info!(
                    "store {} full sync from {}:{} done, next binlog {next_binlog}",
                    meta.id, meta.sync_from_host, meta.sync_from_port
                );
                self.change_repl_state(done, true);
                Ok(())
            }
            Err(e) => {
                // Back to Connect so the next tick re-drives the full sync.
                self.change_repl_state(meta.clone(), false);
                Err(e)
            }
        }
    }

    fn slave_full_sync_inner(&self, meta: &StoreMeta) -> ReplResult<TxnId> {
        let mut client = self.create_repl_client(meta)?;
        let request = ReplRequest::FullSync {
            src_store_id: source_store_id(meta)?,
            dst_store_id: meta.id,
        };
        client.write_line(&request.encode(), IO_TIMEOUT)?;
        let header = client.read_line(CONNECT_TIMEOUT)?;
        let (next_binlog, count) = protocol::parse_full_header(&header)?;

        let db = self
            .segment_mgr()
            .get_db(None, meta.id, LockMode::Exclusive)?;
        let store = Arc::clone(&db.store);
        for _ in 0..count {
            let line = client.read_line(IO_TIMEOUT)?;
            self.rate_limiter().consume(line.len() as u64);
            let chunk = protocol::parse_chunk_frame(&line)?;
            store.load_snapshot_chunk(&chunk)?;
        }
        Ok(next_binlog)
    }

    /// Incremental step: fetch the next batch from the master and apply it
    /// in order under the store lock.
    ///
    /// Returns the (possibly fresh) incremental client and whether any
    /// entries arrived.
    fn slave_catchup(
        &self,
        meta: &StoreMeta,
        client: Option<Box<dyn BlockingClient>>,
    ) -> ReplResult<(Box<dyn BlockingClient>, bool)> {
        let mut client = match client {
            Some(client) => client,
            None => self.create_repl_client(meta)?,
        };

        let request = ReplRequest::IncrSync {
            src_store_id: source_store_id(meta)?,
            dst_store_id: meta.id,
            binlog_id: meta.binlog_id,
        };
        client.write_line(&request.encode(), IO_TIMEOUT)?;
        let header = client.read_line(IO_TIMEOUT)?;
        let (count, next_id) = protocol::parse_binlogs_header(&header)?;
        if count > BINLOG_BATCH {
            return Err(ReplError::protocol(format!(
                "master announced oversized batch of {count}"
            )));
        }
        if count == 0 {
            return Ok((client, false));
        }

        let db = self
            .segment_mgr()
            .get_db(None, meta.id, LockMode::IntentionExclusive)?;
        let store = Arc::clone(&db.store);
        let mut txn = store.create_transaction()?;
        let mut last_applied = meta.binlog_id;
        for _ in 0..count {
            let line = client.read_line(IO_TIMEOUT)?;
            self.rate_limiter().consume(line.len() as u64);
            let entry = protocol::parse_entry_frame(&line)?;
            if !last_applied.is_uninited() && entry.txn_id < last_applied {
                return Err(ReplError::protocol(format!(
                    "out-of-order binlog entry {} after {last_applied}",
                    entry.txn_id
                )));
            }
            store.apply_repl_log(&entry, txn.as_ref())?;
            last_applied = entry.txn_id;
        }
        txn.commit()?;

        let mut new_meta = meta.clone();
        new_meta.binlog_id = next_id;
        self.change_repl_state(new_meta, true);
        Ok((client, true))
    }
}

fn source_store_id(meta: &StoreMeta) -> ReplResult<StoreId> {
    StoreId::try_from(meta.sync_from_id)
        .map_err(|_| ReplError::internal(format!("invalid sync source id {}", meta.sync_from_id)))
}
