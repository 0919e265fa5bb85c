//! # TideKV Core
//!
//! Shared infrastructure for the TideKV server.
//!
//! This crate provides:
//! - Persisted per-store replication metadata and the catalog contract
//! - The session-scoped transaction and lock ledger (`SessionCtx`)
//! - The segment manager handing out store handles under a lock mode
//! - Server configuration

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod catalog;
mod config;
mod error;
mod lock;
mod session;

pub use catalog::{Catalog, FileCatalog, MemCatalog, ReplState, StoreMeta, SYNC_FROM_NONE};
pub use config::ServerConfig;
pub use error::{CoreError, CoreResult};
pub use lock::{DbGuard, LockMode, SegmentMgr, SessionLock, StoreLock};
pub use session::{SessionCtx, TSEP_UNINITED, VERSIONEP_UNINITED};

/// Index of one store within a server.
pub type StoreId = u32;
