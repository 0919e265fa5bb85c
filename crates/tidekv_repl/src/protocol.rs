//! Wire frames of the replication protocol.
//!
//! Everything on the wire is a single line. Command lines travel replica to
//! master; a response whose first byte is `-` denotes failure. Bulk payloads
//! (snapshot chunks, binlog entries) follow their header line, one JSON
//! document per line.

use crate::error::{ReplError, ReplResult};
use tidekv_core::StoreId;
use tidekv_storage::{ReplLogEntry, SnapshotChunk, TxnId};

/// Success response to a bare command.
pub const OK_LINE: &str = "+OK";

/// Idle heartbeat frame on a master push stream.
pub const PING_FRAME: &str = "PING";

/// A command sent by a replica to its master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplRequest {
    /// Authenticate with the master's configured password.
    Auth {
        /// The password.
        password: String,
    },
    /// Request a full dump of one store.
    FullSync {
        /// Store id on the master.
        src_store_id: StoreId,
        /// Store id on the requesting replica.
        dst_store_id: StoreId,
    },
    /// Fetch binlog entries starting at a position.
    IncrSync {
        /// Store id on the master.
        src_store_id: StoreId,
        /// Store id on the requesting replica.
        dst_store_id: StoreId,
        /// First binlog id the replica expects.
        binlog_id: TxnId,
    },
}

impl ReplRequest {
    /// Encodes the command as a wire line.
    pub fn encode(&self) -> String {
        match self {
            Self::Auth { password } => format!("AUTH {password}"),
            Self::FullSync {
                src_store_id,
                dst_store_id,
            } => format!("FULLSYNC {src_store_id} {dst_store_id}"),
            Self::IncrSync {
                src_store_id,
                dst_store_id,
                binlog_id,
            } => format!(
                "INCRSYNC {src_store_id} {dst_store_id} {}",
                binlog_id.as_u64()
            ),
        }
    }

    /// Parses a command line.
    pub fn parse(line: &str) -> ReplResult<Self> {
        let mut parts = line.split_whitespace();
        let verb = parts
            .next()
            .ok_or_else(|| ReplError::protocol("empty command line"))?;
        match verb {
            "AUTH" => {
                let password = parts
                    .next()
                    .ok_or_else(|| ReplError::protocol("AUTH without password"))?;
                Ok(Self::Auth {
                    password: password.to_string(),
                })
            }
            "FULLSYNC" => {
                let src_store_id = parse_field(parts.next(), "FULLSYNC src store")?;
                let dst_store_id = parse_field(parts.next(), "FULLSYNC dst store")?;
                Ok(Self::FullSync {
                    src_store_id,
                    dst_store_id,
                })
            }
            "INCRSYNC" => {
                let src_store_id = parse_field(parts.next(), "INCRSYNC src store")?;
                let dst_store_id = parse_field(parts.next(), "INCRSYNC dst store")?;
                let binlog_id: u64 = parse_field(parts.next(), "INCRSYNC binlog id")?;
                Ok(Self::IncrSync {
                    src_store_id,
                    dst_store_id,
                    binlog_id: TxnId::new(binlog_id),
                })
            }
            other => Err(ReplError::protocol(format!("unknown command {other:?}"))),
        }
    }
}

fn parse_field<T: std::str::FromStr>(field: Option<&str>, what: &str) -> ReplResult<T> {
    field
        .ok_or_else(|| ReplError::protocol(format!("missing {what}")))?
        .parse()
        .map_err(|_| ReplError::protocol(format!("bad {what}")))
}

/// Formats a failure response.
pub fn err_line(why: impl std::fmt::Display) -> String {
    format!("-ERR {why}")
}

/// Checks a bare response line; `-`-prefixed lines become errors.
pub fn check_ok(line: &str) -> ReplResult<()> {
    if line.starts_with('-') || line.is_empty() {
        Err(ReplError::protocol(format!("server rejected: {line}")))
    } else {
        Ok(())
    }
}

/// Header for a full-dump response: the binlog id the replica should expect
/// next, and the number of chunk lines that follow.
pub fn full_header(next_binlog_id: TxnId, count: usize) -> String {
    format!("+FULL {} {count}", next_binlog_id.as_u64())
}

/// Parses a [`full_header`] line.
pub fn parse_full_header(line: &str) -> ReplResult<(TxnId, usize)> {
    check_ok(line)?;
    let mut parts = line.split_whitespace();
    if parts.next() != Some("+FULL") {
        return Err(ReplError::protocol(format!("expected +FULL, got {line:?}")));
    }
    let next: u64 = parse_field(parts.next(), "+FULL binlog id")?;
    let count: usize = parse_field(parts.next(), "+FULL count")?;
    Ok((TxnId::new(next), count))
}

/// Header for an incremental-fetch response: the number of entry lines that
/// follow, and the position the replica should ask from next time.
pub fn binlogs_header(count: usize, next_id: TxnId) -> String {
    format!("+BINLOGS {count} {}", next_id.as_u64())
}

/// Parses a [`binlogs_header`] line.
pub fn parse_binlogs_header(line: &str) -> ReplResult<(usize, TxnId)> {
    check_ok(line)?;
    let mut parts = line.split_whitespace();
    if parts.next() != Some("+BINLOGS") {
        return Err(ReplError::protocol(format!(
            "expected +BINLOGS, got {line:?}"
        )));
    }
    let count: usize = parse_field(parts.next(), "+BINLOGS count")?;
    let next: u64 = parse_field(parts.next(), "+BINLOGS next id")?;
    Ok((count, TxnId::new(next)))
}

/// Encodes one snapshot chunk line.
pub fn chunk_frame(chunk: &SnapshotChunk) -> ReplResult<String> {
    serde_json::to_string(chunk).map_err(|e| ReplError::protocol(e.to_string()))
}

/// Parses one snapshot chunk line.
pub fn parse_chunk_frame(line: &str) -> ReplResult<SnapshotChunk> {
    serde_json::from_str(line).map_err(|e| ReplError::protocol(e.to_string()))
}

/// Encodes one binlog entry line.
pub fn entry_frame(entry: &ReplLogEntry) -> ReplResult<String> {
    serde_json::to_string(entry).map_err(|e| ReplError::protocol(e.to_string()))
}

/// Parses one binlog entry line.
pub fn parse_entry_frame(line: &str) -> ReplResult<ReplLogEntry> {
    serde_json::from_str(line).map_err(|e| ReplError::protocol(e.to_string()))
}

/// Encodes one master push frame.
pub fn push_frame(entry: &ReplLogEntry) -> ReplResult<String> {
    Ok(format!("BINLOG {}", entry_frame(entry)?))
}

/// Parses one master push frame; `None` for a heartbeat.
pub fn parse_push_frame(line: &str) -> ReplResult<Option<ReplLogEntry>> {
    if line == PING_FRAME {
        return Ok(None);
    }
    match line.strip_prefix("BINLOG ") {
        Some(json) => Ok(Some(parse_entry_frame(json)?)),
        None => Err(ReplError::protocol(format!("bad push frame {line:?}"))),
    }
}
