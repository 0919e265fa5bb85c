//! Master-side push routine.
//!
//! Streams binlog entries to one attached downstream. At most one worker
//! runs per `(store, client)` pair, which makes the strictly-increasing
//! delivery order automatic. Client disconnect is handled here, not by the
//! scheduler: a transport error tears the push context down.

use crate::error::ReplResult;
use crate::manager::{ReplManager, BINLOG_BATCH, IO_TIMEOUT};
use crate::net::BlockingClient;
use crate::protocol;
use std::time::{Duration, Instant};
use tidekv_core::StoreId;
use tidekv_storage::TxnId;
use tracing::warn;

/// Backoff when the downstream is fully caught up.
const IDLE_PUSH_DELAY: Duration = Duration::from_secs(1);

impl ReplManager {
    /// Pushes the next batch of binlog entries to one downstream.
    pub(crate) fn master_push_routine(&self, store_id: StoreId, client_id: u64) {
        let idx = store_id as usize;
        let (binlog_pos, client) = {
            let mut state = self.state.lock();
            match state.push_status[idx].get_mut(&client_id) {
                Some(mpov) => {
                    assert!(mpov.is_running, "push routine without running flag");
                    (mpov.binlog_pos, mpov.client.take())
                }
                None => return,
            }
        };
        let mut client =
            client.unwrap_or_else(|| panic!("push client {client_id} missing while running"));

        let result = self.push_once(store_id, binlog_pos, client.as_mut());

        let mut state = self.state.lock();
        match result {
            Ok((new_pos, sent_data)) => {
                if let Some(mpov) = state.push_status[idx].get_mut(&client_id) {
                    assert!(mpov.is_running);
                    assert!(new_pos >= mpov.binlog_pos, "binlog position went backwards");
                    mpov.is_running = false;
                    mpov.binlog_pos = new_pos;
                    mpov.client = Some(client);
                    mpov.next_sched_time = if sent_data {
                        Instant::now()
                    } else {
                        Instant::now() + IDLE_PUSH_DELAY
                    };
                }
            }
            Err(e) => {
                warn!("store {store_id} push to client {client_id} failed: {e}, detaching");
                state.push_status[idx].remove(&client_id);
            }
        }
    }

    fn push_once(
        &self,
        store_id: StoreId,
        from: TxnId,
        client: &mut dyn BlockingClient,
    ) -> ReplResult<(TxnId, bool)> {
        let (entries, next) = self.fetch_binlogs(store_id, from, BINLOG_BATCH)?;
        if entries.is_empty() {
            client.write_line(protocol::PING_FRAME, IO_TIMEOUT)?;
            return Ok((from, false));
        }
        for entry in &entries {
            let line = protocol::push_frame(entry)?;
            self.rate_limiter().consume(line.len() as u64);
            client.write_line(&line, IO_TIMEOUT)?;
        }
        Ok((next, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{ChannelNetwork, NetworkService};
    use std::sync::Arc;
    use tempfile::tempdir;
    use tidekv_core::{Catalog, MemCatalog, SegmentMgr, ServerConfig};
    use tidekv_storage::{MemStore, Store, StoreTransaction};

    const TIMEOUT: Duration = Duration::from_millis(200);

    struct Fixture {
        mgr: Arc<ReplManager>,
        store: Arc<MemStore>,
        net: ChannelNetwork,
        _dump: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dump = tempdir().unwrap();
        let cfg = ServerConfig::new(dump.path(), 1);
        let store = Arc::new(MemStore::new());
        let seg = Arc::new(SegmentMgr::new(vec![Arc::clone(&store) as Arc<dyn Store>]));
        let net = ChannelNetwork::new();
        let mgr = Arc::new(ReplManager::new(
            cfg,
            Arc::new(MemCatalog::new()) as Arc<dyn Catalog>,
            seg,
            Arc::new(net.clone()) as Arc<dyn NetworkService>,
        ));
        mgr.load_state().unwrap();
        Fixture {
            mgr,
            store,
            net,
            _dump: dump,
        }
    }

    fn commit_set(store: &MemStore, key: &[u8], value: &[u8]) -> TxnId {
        let mut txn = store.create_transaction().unwrap();
        txn.set(key, value).unwrap();
        txn.commit().unwrap()
    }

    fn mark_running(mgr: &ReplManager, client_id: u64) {
        mgr.state.lock().push_status[0]
            .get_mut(&client_id)
            .unwrap()
            .is_running = true;
    }

    #[test]
    fn push_streams_entries_in_order() {
        let f = fixture();
        for i in 0..5u8 {
            commit_set(&f.store, &[i], &[i]);
        }
        let listener = f.net.listen("downstream", 9000);
        let mut client = f.net.create_blocking_client(1024);
        client.connect("downstream", 9000, TIMEOUT).unwrap();
        let conn = listener.recv().unwrap();

        let id = f
            .mgr
            .register_incr_sync(0, 2, client, TxnId::new(1))
            .unwrap();
        mark_running(&f.mgr, id);
        f.mgr.master_push_routine(0, id);

        for expected in 1..=5u64 {
            let line = conn.read_line(TIMEOUT).unwrap();
            let entry = protocol::parse_push_frame(&line).unwrap().unwrap();
            assert_eq!(entry.txn_id, TxnId::new(expected));
        }
        assert_eq!(f.mgr.push_binlog_pos(0, id).unwrap(), TxnId::new(6));
    }

    #[test]
    fn push_heartbeats_when_caught_up() {
        let f = fixture();
        let listener = f.net.listen("downstream", 9000);
        let mut client = f.net.create_blocking_client(1024);
        client.connect("downstream", 9000, TIMEOUT).unwrap();
        let conn = listener.recv().unwrap();

        let id = f
            .mgr
            .register_incr_sync(0, 0, client, TxnId::MIN_VALID)
            .unwrap();
        mark_running(&f.mgr, id);
        f.mgr.master_push_routine(0, id);

        assert_eq!(conn.read_line(TIMEOUT).unwrap(), protocol::PING_FRAME);
        // Position must not move on an idle push.
        assert_eq!(f.mgr.push_binlog_pos(0, id).unwrap(), TxnId::MIN_VALID);
    }

    #[test]
    fn transport_error_detaches_downstream() {
        let f = fixture();
        let listener = f.net.listen("downstream", 9000);
        let mut client = f.net.create_blocking_client(1024);
        client.connect("downstream", 9000, TIMEOUT).unwrap();
        let conn = listener.recv().unwrap();

        let id = f
            .mgr
            .register_incr_sync(0, 0, client, TxnId::MIN_VALID)
            .unwrap();
        conn.close();
        mark_running(&f.mgr, id);
        f.mgr.master_push_routine(0, id);

        assert!(f.mgr.push_client_ids(0).is_empty());
    }

    #[test]
    fn push_resumes_from_position() {
        let f = fixture();
        for i in 0..6u8 {
            commit_set(&f.store, &[i], &[i]);
        }
        let listener = f.net.listen("downstream", 9000);
        let mut client = f.net.create_blocking_client(1024);
        client.connect("downstream", 9000, TIMEOUT).unwrap();
        let conn = listener.recv().unwrap();

        // Attach mid-stream: entries below the position are never sent.
        let id = f
            .mgr
            .register_incr_sync(0, 0, client, TxnId::new(4))
            .unwrap();
        mark_running(&f.mgr, id);
        f.mgr.master_push_routine(0, id);

        let line = conn.read_line(TIMEOUT).unwrap();
        let entry = protocol::parse_push_frame(&line).unwrap().unwrap();
        assert_eq!(entry.txn_id, TxnId::new(4));
    }
}
