//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a TideKV server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory receiving archived binlog dump files.
    pub dump_path: PathBuf,
    /// Password replicas present to their master; empty disables auth.
    pub masterauth: String,
    /// Number of stores composing the server.
    pub store_count: usize,
    /// Worker count for incremental push and log recycling pools.
    pub incr_pool_size: usize,
    /// Worker count for full-dump push and receive pools.
    pub max_full_paral: usize,
    /// Token-bucket rate applied to bulk transfers, in bytes per second.
    pub rate_limit_bytes_per_sec: u64,
    /// Size at which an archival dump file is rotated.
    pub binlog_file_max_bytes: u64,
    /// Age at which an archival dump file is rotated.
    pub binlog_file_max_age: Duration,
}

impl ServerConfig {
    /// Creates a configuration with the given dump directory and store count.
    pub fn new(dump_path: impl Into<PathBuf>, store_count: usize) -> Self {
        Self {
            dump_path: dump_path.into(),
            masterauth: String::new(),
            store_count,
            incr_pool_size: 4,
            max_full_paral: 2,
            rate_limit_bytes_per_sec: 64 * 1024 * 1024,
            binlog_file_max_bytes: 64 * 1024 * 1024,
            binlog_file_max_age: Duration::from_secs(20 * 60),
        }
    }

    /// Sets the master auth password.
    pub fn with_masterauth(mut self, password: impl Into<String>) -> Self {
        self.masterauth = password.into();
        self
    }

    /// Sets the incremental pool size.
    pub fn with_incr_pool_size(mut self, size: usize) -> Self {
        self.incr_pool_size = size;
        self
    }

    /// Sets the full-sync parallelism ceiling.
    pub fn with_max_full_paral(mut self, size: usize) -> Self {
        self.max_full_paral = size;
        self
    }

    /// Sets the bulk-transfer rate limit.
    pub fn with_rate_limit(mut self, bytes_per_sec: u64) -> Self {
        self.rate_limit_bytes_per_sec = bytes_per_sec;
        self
    }

    /// Sets the dump file rotation thresholds.
    pub fn with_dump_rotation(mut self, max_bytes: u64, max_age: Duration) -> Self {
        self.binlog_file_max_bytes = max_bytes;
        self.binlog_file_max_age = max_age;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("dump", 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rate_limit_is_64mib() {
        let config = ServerConfig::default();
        assert_eq!(config.rate_limit_bytes_per_sec, 64 * 1024 * 1024);
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new("/var/lib/tidekv/dump", 4)
            .with_masterauth("sekrit")
            .with_incr_pool_size(8)
            .with_max_full_paral(3);
        assert_eq!(config.store_count, 4);
        assert_eq!(config.masterauth, "sekrit");
        assert_eq!(config.incr_pool_size, 8);
        assert_eq!(config.max_full_paral, 3);
    }
}
