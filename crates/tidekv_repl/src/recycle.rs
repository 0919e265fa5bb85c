//! Binlog recycler.
//!
//! Truncates the binlog range no downstream still needs, optionally
//! archiving it to rotating dump files first. The truncation bound is the
//! minimum downstream position sampled by the scheduler under the manager
//! mutex; positions are monotone, so the sample stays a safe lower bound at
//! truncation time.
//!
//! Archive and truncate act as one logical transaction per batch: an
//! archival failure aborts the truncation, and the retention floor is only
//! advanced after the store commit succeeds.

use crate::error::ReplResult;
use crate::manager::ReplManager;
use crate::protocol;
use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tidekv_core::{LockMode, SessionCtx, StoreId};
use tidekv_storage::{ReplLogEntry, TxnId};
use tracing::{info, warn};

/// Delay before retrying when there was nothing to do or a step failed.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Dump file state checked out by the recycle worker.
pub(crate) struct ArchiveState {
    fs: Option<File>,
    file_seq: u32,
    file_create_time: Instant,
    file_size: u64,
}

/// Publishes the recycle outcome when the routine exits, however it exits.
struct RecycleReleaseGuard<'a> {
    mgr: &'a ReplManager,
    store_id: StoreId,
    next_sched: Instant,
    first_binlog: TxnId,
    archive: Option<ArchiveState>,
}

impl Drop for RecycleReleaseGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.mgr.state.lock();
        let status = &mut state.log_recyc_status[self.store_id as usize];
        assert!(status.is_running, "recycle release without running flag");
        status.is_running = false;
        status.next_sched_time = self.next_sched;
        status.first_binlog_id = self.first_binlog;
        if let Some(archive) = self.archive.take() {
            status.fs = archive.fs;
            status.file_seq = archive.file_seq;
            status.file_create_time = archive.file_create_time;
            status.file_size = archive.file_size;
        }
    }
}

impl ReplManager {
    /// Recycles one store's binlog range `[start, end)`.
    pub(crate) fn recycle_binlog(
        &self,
        store_id: StoreId,
        start: TxnId,
        end: TxnId,
        save_logs: bool,
    ) {
        let mut guard = RecycleReleaseGuard {
            mgr: self,
            store_id,
            next_sched: Instant::now(),
            first_binlog: start,
            archive: None,
        };
        if save_logs {
            guard.archive = Some(self.take_archive_state(store_id));
        }
        if let Err(e) = self.recycle_once(store_id, start, end, &mut guard) {
            warn!("store {store_id} binlog recycle failed: {e}");
            guard.next_sched = Instant::now() + RETRY_DELAY;
        }
    }

    fn recycle_once(
        &self,
        store_id: StoreId,
        start: TxnId,
        end: TxnId,
        guard: &mut RecycleReleaseGuard<'_>,
    ) -> ReplResult<()> {
        let session = Arc::new(SessionCtx::new());
        session.set_args_brief(&[
            "truncatelog".to_string(),
            store_id.to_string(),
            start.as_u64().to_string(),
            end.as_u64().to_string(),
        ]);

        let db = self
            .segment_mgr()
            .get_db(Some(&session), store_id, LockMode::IntentionExclusive)?;
        let store = Arc::clone(&db.store);
        let mut txn = store.create_transaction()?;

        let (new_start, entries) = store.get_truncate_log(start, end, txn.as_ref())?;
        if new_start == start {
            assert!(entries.is_empty(), "no-op truncation returned entries");
            guard.next_sched = Instant::now() + RETRY_DELAY;
            return Ok(());
        }

        if let Some(archive) = guard.archive.as_mut() {
            self.save_binlogs(store_id, &entries, archive)?;
        }
        store.truncate_binlog(&entries, txn.as_ref())?;
        txn.commit()?;

        info!("store {store_id} truncated binlog from {start} to {new_start}");
        guard.first_binlog = new_start;
        Ok(())
    }

    fn take_archive_state(&self, store_id: StoreId) -> ArchiveState {
        let mut state = self.state.lock();
        let status = &mut state.log_recyc_status[store_id as usize];
        ArchiveState {
            fs: status.fs.take(),
            file_seq: status.file_seq,
            file_create_time: status.file_create_time,
            file_size: status.file_size,
        }
    }

    /// Appends entries to the store's dump file, rotating by size and age.
    fn save_binlogs(
        &self,
        store_id: StoreId,
        entries: &[ReplLogEntry],
        archive: &mut ArchiveState,
    ) -> ReplResult<()> {
        let cfg = self.config();
        for entry in entries {
            let rotate = match &archive.fs {
                Some(_) => {
                    archive.file_size >= cfg.binlog_file_max_bytes
                        || archive.file_create_time.elapsed() >= cfg.binlog_file_max_age
                }
                None => true,
            };
            if rotate {
                archive.fs = None;
                let seq = archive.file_seq + 1;
                let dir = self.dump_path().join(store_id.to_string());
                fs::create_dir_all(&dir)?;
                let path = dir.join(format!(
                    "binlog-{store_id}-{seq}-{}.log",
                    Utc::now().timestamp()
                ));
                let file = OpenOptions::new().create_new(true).append(true).open(&path)?;
                info!("store {store_id} rotated to dump file {}", path.display());
                archive.fs = Some(file);
                archive.file_seq = seq;
                archive.file_create_time = Instant::now();
                archive.file_size = 0;
            }
            let file = archive.fs.as_mut().expect("dump file opened above");
            let mut line = protocol::entry_frame(entry)?;
            line.push('\n');
            self.rate_limiter().consume(line.len() as u64);
            file.write_all(line.as_bytes())?;
            archive.file_size += line.len() as u64;
        }
        if let Some(file) = archive.fs.as_mut() {
            file.sync_data()?;
        }
        Ok(())
    }
}
