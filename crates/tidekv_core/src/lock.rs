//! Lock modes and the segment manager.
//!
//! The multi-granular lock manager itself is an external collaborator; this
//! module carries its contract: the mode lattice, the session-held lock
//! handle, and the segment manager that hands out store handles under a
//! requested mode.

use crate::error::{CoreError, CoreResult};
use crate::session::SessionCtx;
use crate::StoreId;
use std::sync::Arc;
use tidekv_storage::Store;

/// Lock mode, ordered by strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    /// No lock.
    None,
    /// Intention shared.
    IntentionShared,
    /// Intention exclusive.
    IntentionExclusive,
    /// Shared.
    Shared,
    /// Exclusive.
    Exclusive,
}

/// A lock handle held by a session.
///
/// Handles are compared by identity: the same `Arc` that was added to a
/// session must be the one removed from it.
pub trait SessionLock: Send + Sync {
    /// The store this lock covers.
    fn store_id(&self) -> StoreId;

    /// The key this lock covers; empty for store-level locks.
    fn key(&self) -> &str;

    /// The held mode.
    fn mode(&self) -> LockMode;
}

/// A store-level lock handle.
#[derive(Debug)]
pub struct StoreLock {
    store_id: StoreId,
    mode: LockMode,
}

impl StoreLock {
    /// Creates a handle for `store_id` at `mode`.
    pub fn new(store_id: StoreId, mode: LockMode) -> Self {
        Self { store_id, mode }
    }
}

impl SessionLock for StoreLock {
    fn store_id(&self) -> StoreId {
        self.store_id
    }

    fn key(&self) -> &str {
        ""
    }

    fn mode(&self) -> LockMode {
        self.mode
    }
}

/// A store handle checked out from the segment manager.
///
/// When the checkout registered a lock with a session, dropping the guard
/// unregisters it.
pub struct DbGuard {
    /// The store.
    pub store: Arc<dyn Store>,
    lock: Option<Arc<dyn SessionLock>>,
    session: Option<Arc<SessionCtx>>,
}

impl DbGuard {
    /// The lock handle taken for this checkout, if any.
    pub fn lock(&self) -> Option<&Arc<dyn SessionLock>> {
        self.lock.as_ref()
    }
}

impl Drop for DbGuard {
    fn drop(&mut self) {
        if let (Some(session), Some(lock)) = (&self.session, &self.lock) {
            session.remove_lock(lock);
        }
    }
}

/// Owns the server's stores and hands out per-store handles.
pub struct SegmentMgr {
    stores: Vec<Arc<dyn Store>>,
}

impl SegmentMgr {
    /// Creates a segment manager over the given stores.
    pub fn new(stores: Vec<Arc<dyn Store>>) -> Self {
        Self { stores }
    }

    /// Number of stores.
    pub fn store_count(&self) -> usize {
        self.stores.len()
    }

    /// Checks out the store `store_id` under `mode`.
    ///
    /// When a session is supplied and a lock is taken, the lock handle is
    /// registered with the session for the guard's lifetime.
    pub fn get_db(
        &self,
        session: Option<&Arc<SessionCtx>>,
        store_id: StoreId,
        mode: LockMode,
    ) -> CoreResult<DbGuard> {
        let store = self
            .stores
            .get(store_id as usize)
            .cloned()
            .ok_or_else(|| CoreError::invalid_argument(format!("invalid store id {store_id}")))?;

        if mode == LockMode::None {
            return Ok(DbGuard {
                store,
                lock: None,
                session: None,
            });
        }

        let lock: Arc<dyn SessionLock> = Arc::new(StoreLock::new(store_id, mode));
        if let Some(session) = session {
            session.add_lock(Arc::clone(&lock));
            return Ok(DbGuard {
                store,
                lock: Some(lock),
                session: Some(Arc::clone(session)),
            });
        }
        Ok(DbGuard {
            store,
            lock: Some(lock),
            session: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidekv_storage::MemStore;

    fn mgr(n: usize) -> SegmentMgr {
        SegmentMgr::new((0..n).map(|_| Arc::new(MemStore::new()) as Arc<dyn Store>).collect())
    }

    #[test]
    fn lock_mode_strength_order() {
        assert!(LockMode::None < LockMode::IntentionShared);
        assert!(LockMode::IntentionShared < LockMode::IntentionExclusive);
        assert!(LockMode::IntentionExclusive < LockMode::Shared);
        assert!(LockMode::Shared < LockMode::Exclusive);
    }

    #[test]
    fn get_db_bounds_check() {
        let mgr = mgr(2);
        assert!(mgr.get_db(None, 1, LockMode::None).is_ok());
        assert!(mgr.get_db(None, 2, LockMode::None).is_err());
    }

    #[test]
    fn guard_registers_and_unregisters_session_lock() {
        let mgr = mgr(1);
        let session = Arc::new(SessionCtx::new());
        {
            let guard = mgr
                .get_db(Some(&session), 0, LockMode::IntentionExclusive)
                .unwrap();
            assert_eq!(session.lock_states().len(), 1);
            assert_eq!(guard.lock().unwrap().mode(), LockMode::IntentionExclusive);
        }
        assert!(session.lock_states().is_empty());
    }

    #[test]
    fn lock_none_takes_no_lock() {
        let mgr = mgr(1);
        let session = Arc::new(SessionCtx::new());
        let guard = mgr.get_db(Some(&session), 0, LockMode::None).unwrap();
        assert!(guard.lock().is_none());
        assert!(session.lock_states().is_empty());
    }
}
