//! # TideKV Replication
//!
//! The replication core of a TideKV server: brings each of the server's
//! stores into eventual consistency with its configured source, streams
//! committed binlog entries to attached downstream replicas, and recycles
//! the on-disk binlog once every consumer has advanced past it.
//!
//! One [`ReplManager`] exists per server. It owns a per-store replication
//! context for every store plus a single scheduler thread that scans all
//! contexts under one mutex and dispatches ready work onto five bounded
//! worker pools. Workers run outside the lock and reacquire it only to
//! publish results and reschedule.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod manager;
mod master;
mod net;
mod pool;
pub mod protocol;
mod recycle;
mod slave;
mod status;

pub use error::{ReplError, ReplResult};
pub use manager::ReplManager;
pub use net::{
    BlockingClient, ChannelNetwork, ChannelServerConn, NetworkService, RateLimiter, SESSION_NONE,
};
pub use pool::WorkerPool;
pub use protocol::ReplRequest;
