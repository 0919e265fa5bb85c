//! # TideKV Storage
//!
//! Store engine contract for TideKV.
//!
//! This crate provides:
//! - The opaque per-store KV engine traits (`Store`, `StoreTransaction`,
//!   `BinlogCursor`)
//! - Binlog entry types shared by replication and archival
//! - An in-memory engine (`MemStore`) used by tests and tooling

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod binlog;
mod error;
mod memory;
mod store;

pub use binlog::{ReplLogEntry, ReplOp, TxnId};
pub use error::{StorageError, StorageResult};
pub use memory::MemStore;
pub use store::{BinlogCursor, SnapshotChunk, Store, StoreMode, StoreTransaction};
