//! Storage engine collaborator
//!
//! The replication layer never stores data itself. It drives an engine that
//! owns the key/value pairs, executes incr/decr/append/prepend, adopts the CAS
//! values proposed by the master and answers backfill queries. Each operation
//! is atomic per key; that guarantee belongs to the engine.

use super::message::{
    AppendPrepend, BackfillRange, BackfillSet, Cas, Delete, GetCas, IncrDecr, ReplTimestamp, Sarc,
    StoreKey,
};
use crate::core::StoreError;
use bytes::Bytes;
use std::future::Future;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Hash used to place keys in `(hash_value, hashmod)` partitions
pub fn key_hash(key: &[u8]) -> u32 {
    crc32fast::hash(key)
}

/// Current state of one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredItem {
    pub value: Bytes,
    pub flags: u32,
    /// Absolute unix seconds, 0 = never expires
    pub exptime: u32,
    /// 0 when no CAS was ever assigned
    pub cas: Cas,
    /// Timestamp of the last mutation
    pub timestamp: ReplTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Stored,
    /// Add of a present key, or replace of an absent one
    NotStored,
    /// CAS did not match
    Exists,
    /// CAS requested on an absent key
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrDecrOutcome {
    Applied(u64),
    NotFound,
    NotNumeric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendPrependOutcome {
    Applied,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Historical state needed to bring a slave up to date
///
/// Consumers must emit `range_tombstones` first, then `deletions`, then
/// `items`, so that no tombstone ever follows a point entry for a live key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillSnapshot {
    pub range_tombstones: Vec<BackfillRange>,
    /// Keys deleted since the requested timestamp and not live now
    pub deletions: Vec<Delete>,
    /// Live keys modified since the requested timestamp
    pub items: Vec<BackfillSet>,
}

impl BackfillSnapshot {
    pub fn entry_count(&self) -> usize {
        self.range_tombstones.len() + self.deletions.len() + self.items.len()
    }
}

/// Operations the replication layer needs from a storage engine
pub trait StorageEngine: Send + Sync + 'static {
    /// Unix seconds at which this database was created
    fn creation_timestamp(&self) -> u32;

    fn get(&self, key: &StoreKey) -> impl Future<Output = StoreResult<Option<StoredItem>>> + Send;

    /// Assign `proposed_cas` if the value has no CAS yet; returns the CAS in effect
    fn get_cas(&self, op: &GetCas) -> impl Future<Output = StoreResult<Option<Cas>>> + Send;

    fn conditional_set(&self, op: &Sarc) -> impl Future<Output = StoreResult<SetOutcome>> + Send;

    fn incr(&self, op: &IncrDecr) -> impl Future<Output = StoreResult<IncrDecrOutcome>> + Send;

    fn decr(&self, op: &IncrDecr) -> impl Future<Output = StoreResult<IncrDecrOutcome>> + Send;

    fn append(
        &self,
        op: &AppendPrepend,
    ) -> impl Future<Output = StoreResult<AppendPrependOutcome>> + Send;

    fn prepend(
        &self,
        op: &AppendPrepend,
    ) -> impl Future<Output = StoreResult<AppendPrependOutcome>> + Send;

    fn delete(&self, op: &Delete) -> impl Future<Output = StoreResult<DeleteOutcome>> + Send;

    /// Remove every key covered by `range`; returns the number removed
    fn delete_range(&self, range: &BackfillRange)
    -> impl Future<Output = StoreResult<usize>> + Send;

    /// Unconditional overwrite with an authoritative backfill value
    fn backfill_set(&self, entry: &BackfillSet) -> impl Future<Output = StoreResult<()>> + Send;

    /// Unconditional removal of a key deleted on the master
    fn backfill_delete(&self, entry: &Delete) -> impl Future<Output = StoreResult<()>> + Send;

    /// Everything that changed at or after `since`
    ///
    /// `ReplTimestamp::DISTANT_PAST`, or a `since` older than the retained
    /// history, yields a full reset (whole-partition tombstones plus every
    /// live key).
    fn snapshot_for_backfill(
        &self,
        since: ReplTimestamp,
    ) -> impl Future<Output = StoreResult<BackfillSnapshot>> + Send;
}
