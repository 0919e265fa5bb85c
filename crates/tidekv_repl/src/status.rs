//! Per-store runtime replication state.
//!
//! These structures live for the lifetime of the manager and are only ever
//! touched under the manager mutex; the optional transport client and dump
//! file inside them are taken out by the single worker that owns the
//! corresponding `is_running` flag and put back when it publishes.

use crate::net::{BlockingClient, SESSION_NONE};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::time::Instant;
use tidekv_core::StoreId;
use tidekv_storage::TxnId;

/// Slave point-of-view state for one store.
pub(crate) struct SPovStatus {
    /// True while a worker is executing the slave routine for this store.
    pub is_running: bool,
    /// Incremental-sync session with the master, or [`SESSION_NONE`].
    pub session_id: u64,
    /// Persistent incremental client, when one is established.
    pub client: Option<Box<dyn BlockingClient>>,
    /// Earliest instant the scheduler may dispatch this store again.
    pub next_sched_time: Instant,
    /// Wall-clock time of the last successful sync step.
    pub last_sync_time: DateTime<Utc>,
}

impl SPovStatus {
    pub fn new() -> Self {
        Self {
            is_running: false,
            session_id: SESSION_NONE,
            client: None,
            next_sched_time: Instant::now(),
            last_sync_time: Utc::now(),
        }
    }
}

/// Master point-of-view state for one `(store, client)` pair.
pub(crate) struct MPovStatus {
    /// True while a worker is pushing to this client.
    pub is_running: bool,
    /// Downstream client id, unique per manager.
    pub client_id: u64,
    /// Store id on the downstream server.
    pub dst_store_id: StoreId,
    /// Next binlog id to send. Monotone non-decreasing.
    pub binlog_pos: TxnId,
    /// Remote endpoint, cached for status output.
    pub remote_repr: String,
    /// The downstream transport, absent while the push worker holds it.
    pub client: Option<Box<dyn BlockingClient>>,
    /// Earliest instant the scheduler may dispatch this pair again.
    pub next_sched_time: Instant,
}

/// Binlog-recycling state for one store.
pub(crate) struct RecycleBinlogStatus {
    /// True while a recycle worker runs for this store.
    pub is_running: bool,
    /// Earliest instant the scheduler may dispatch recycling again.
    pub next_sched_time: Instant,
    /// Lowest retained binlog id. Monotone non-decreasing.
    pub first_binlog_id: TxnId,
    /// Next dump file sequence number.
    pub file_seq: u32,
    /// Creation instant of the open dump file.
    pub file_create_time: Instant,
    /// Bytes written to the open dump file.
    pub file_size: u64,
    /// The open dump file, absent while the recycle worker holds it.
    pub fs: Option<File>,
}

impl RecycleBinlogStatus {
    pub fn new(file_seq: u32) -> Self {
        Self {
            is_running: false,
            next_sched_time: Instant::now(),
            first_binlog_id: TxnId::UNINITED,
            file_seq,
            file_create_time: Instant::now(),
            file_size: 0,
            fs: None,
        }
    }
}
