//! Persisted per-store replication metadata.
//!
//! The catalog is an opaque metadata store keyed by store id. The file-backed
//! implementation keeps one JSON document per store under the catalog
//! directory, written atomically (temp file, rename, directory fsync) so a
//! crash mid-write never corrupts an existing record.

use crate::error::{CoreError, CoreResult};
use crate::StoreId;
use fs2::FileExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tidekv_storage::TxnId;

/// Sentinel for "no upstream store id configured".
pub const SYNC_FROM_NONE: i64 = -1;

/// Replication state of one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplState {
    /// Not replicating.
    None,
    /// Should connect to the configured source and start a full sync.
    Connect,
    /// Full dump in flight. Only ever visible inside the slave routine.
    Transfer,
    /// Incremental streaming from the source.
    Connected,
}

impl ReplState {
    /// Numeric encoding used by the operator status JSON.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Connect => 1,
            Self::Transfer => 2,
            Self::Connected => 3,
        }
    }
}

/// Persisted replication metadata for one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMeta {
    /// Store index; equals the array slot holding this meta.
    pub id: StoreId,
    /// Upstream host; empty means this store is a master source.
    pub sync_from_host: String,
    /// Upstream port.
    pub sync_from_port: u16,
    /// Store id on the upstream server, or [`SYNC_FROM_NONE`].
    pub sync_from_id: i64,
    /// Next binlog sequence this replica expects to receive.
    pub binlog_id: TxnId,
    /// Current replication state.
    pub repl_state: ReplState,
}

impl StoreMeta {
    /// Creates the default meta for a store with no replication source.
    #[must_use]
    pub fn new_default(id: StoreId) -> Self {
        Self {
            id,
            sync_from_host: String::new(),
            sync_from_port: 0,
            sync_from_id: SYNC_FROM_NONE,
            binlog_id: TxnId::UNINITED,
            repl_state: ReplState::None,
        }
    }

    /// Returns true if no replication source is configured.
    #[must_use]
    pub fn source_is_empty(&self) -> bool {
        self.sync_from_host.is_empty()
    }
}

/// Opaque persistent metadata store.
pub trait Catalog: Send + Sync {
    /// Loads the meta for one store; [`CoreError::NotFound`] if absent.
    fn get_store_meta(&self, id: StoreId) -> CoreResult<StoreMeta>;

    /// Persists the meta for one store.
    fn set_store_meta(&self, meta: &StoreMeta) -> CoreResult<()>;
}

/// In-memory catalog for tests.
#[derive(Debug, Default)]
pub struct MemCatalog {
    metas: RwLock<HashMap<StoreId, StoreMeta>>,
    fail_reads: RwLock<bool>,
}

impl MemCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent read fail with an internal error.
    pub fn poison_reads(&self) {
        *self.fail_reads.write() = true;
    }

    /// Returns the number of persisted metas.
    pub fn len(&self) -> usize {
        self.metas.read().len()
    }

    /// Returns true if no meta has been persisted.
    pub fn is_empty(&self) -> bool {
        self.metas.read().is_empty()
    }
}

impl Catalog for MemCatalog {
    fn get_store_meta(&self, id: StoreId) -> CoreResult<StoreMeta> {
        if *self.fail_reads.read() {
            return Err(CoreError::internal("catalog poisoned"));
        }
        self.metas
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("store meta {id}")))
    }

    fn set_store_meta(&self, meta: &StoreMeta) -> CoreResult<()> {
        self.metas.write().insert(meta.id, meta.clone());
        Ok(())
    }
}

/// File name of the catalog directory lock.
const LOCK_FILE: &str = "LOCK";

/// File-backed catalog, one JSON document per store.
#[derive(Debug)]
pub struct FileCatalog {
    dir: PathBuf,
    _lock_file: File,
}

impl FileCatalog {
    /// Opens or creates a catalog directory, taking an exclusive advisory
    /// lock on it.
    pub fn open(dir: &Path) -> CoreResult<Self> {
        fs::create_dir_all(dir)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::CatalogLocked);
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    fn meta_path(&self, id: StoreId) -> PathBuf {
        self.dir.join(format!("store-{id}.json"))
    }

    #[cfg(unix)]
    fn sync_dir(&self) -> CoreResult<()> {
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> CoreResult<()> {
        Ok(())
    }
}

impl Catalog for FileCatalog {
    fn get_store_meta(&self, id: StoreId) -> CoreResult<StoreMeta> {
        let path = self.meta_path(id);
        if !path.exists() {
            return Err(CoreError::not_found(format!("store meta {id}")));
        }
        let data = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&data)?)
    }

    fn set_store_meta(&self, meta: &StoreMeta) -> CoreResult<()> {
        let tmp = self.dir.join(format!("store-{}.json.tmp", meta.id));
        let data = serde_json::to_string_pretty(meta)?;
        {
            let mut file = File::create(&tmp)?;
            file.write_all(data.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.meta_path(meta.id))?;
        self.sync_dir()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn repl_state_encoding() {
        assert_eq!(ReplState::None.as_u8(), 0);
        assert_eq!(ReplState::Connect.as_u8(), 1);
        assert_eq!(ReplState::Transfer.as_u8(), 2);
        assert_eq!(ReplState::Connected.as_u8(), 3);
    }

    #[test]
    fn default_meta_has_no_source() {
        let meta = StoreMeta::new_default(3);
        assert_eq!(meta.id, 3);
        assert!(meta.source_is_empty());
        assert_eq!(meta.sync_from_id, SYNC_FROM_NONE);
        assert_eq!(meta.binlog_id, TxnId::UNINITED);
        assert_eq!(meta.repl_state, ReplState::None);
    }

    #[test]
    fn mem_catalog_round_trip() {
        let catalog = MemCatalog::new();
        assert!(catalog.get_store_meta(0).unwrap_err().is_not_found());

        let meta = StoreMeta {
            id: 0,
            sync_from_host: "10.0.0.1".into(),
            sync_from_port: 7000,
            sync_from_id: 5,
            binlog_id: TxnId::new(77),
            repl_state: ReplState::Connected,
        };
        catalog.set_store_meta(&meta).unwrap();
        assert_eq!(catalog.get_store_meta(0).unwrap(), meta);
    }

    #[test]
    fn file_catalog_round_trip() {
        let temp = tempdir().unwrap();
        let catalog = FileCatalog::open(temp.path()).unwrap();

        assert!(catalog.get_store_meta(2).unwrap_err().is_not_found());

        let meta = StoreMeta {
            id: 2,
            sync_from_host: "replica.example".into(),
            sync_from_port: 6380,
            sync_from_id: 0,
            binlog_id: TxnId::new(1024),
            repl_state: ReplState::Connect,
        };
        catalog.set_store_meta(&meta).unwrap();
        assert_eq!(catalog.get_store_meta(2).unwrap(), meta);

        // Overwrite wins.
        let mut updated = meta.clone();
        updated.repl_state = ReplState::Connected;
        catalog.set_store_meta(&updated).unwrap();
        assert_eq!(catalog.get_store_meta(2).unwrap(), updated);
    }

    #[test]
    fn file_catalog_lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let _first = FileCatalog::open(temp.path()).unwrap();
        assert!(matches!(
            FileCatalog::open(temp.path()),
            Err(CoreError::CatalogLocked)
        ));
    }

    #[test]
    fn file_catalog_persists_uninited_sentinel() {
        let temp = tempdir().unwrap();
        let catalog = FileCatalog::open(temp.path()).unwrap();
        let meta = StoreMeta::new_default(0);
        catalog.set_store_meta(&meta).unwrap();
        assert_eq!(catalog.get_store_meta(0).unwrap(), meta);
    }
}
