use crate::replication::message::{Cas, ReplTimestamp};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Stored value in the KV store with metadata
#[derive(Debug, Clone)]
pub struct StoredValue {
    /// Raw byte data
    pub data: Bytes,
    /// Opaque client flags
    pub flags: u32,
    /// Absolute expiry in unix seconds, 0 = never
    pub exptime: u32,
    /// Version token, 0 until one is assigned
    pub cas: Cas,
    /// Replication timestamp of the last mutation
    pub timestamp: ReplTimestamp,
}

impl StoredValue {
    pub fn new(data: Bytes, flags: u32, exptime: u32, cas: Cas, timestamp: ReplTimestamp) -> Self {
        Self {
            data,
            flags,
            exptime,
            cas,
            timestamp,
        }
    }

    /// Check if the value has expired at `now` (unix seconds)
    pub fn is_expired(&self, now: u64) -> bool {
        self.exptime != 0 && u64::from(self.exptime) <= now
    }
}

/// Configuration for KV store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KVConfig {
    /// Maximum memory in MB
    pub max_memory_mb: usize,
    /// Number of deletions remembered for partial backfill
    pub deletion_history: usize,
    /// Hash partitions used when tombstoning the whole keyspace
    pub backfill_partitions: u32,
    /// Expired key cleanup interval in milliseconds
    pub expiry_cleanup_interval_ms: u64,
}

impl Default for KVConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 4096,
            deletion_history: 100_000,
            backfill_partitions: 1,
            expiry_cleanup_interval_ms: 1000,
        }
    }
}

/// Statistics for KV store
#[derive(Debug, Default, Clone, Serialize)]
pub struct KVStats {
    /// Total number of keys
    pub total_keys: usize,
    /// Estimated memory usage in bytes
    pub total_memory_bytes: usize,
    /// Number of GET operations
    pub gets: u64,
    /// Number of mutations that stored a value
    pub sets: u64,
    /// Number of keys removed
    pub dels: u64,
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
}
