use super::error::{Result, StoreError};
use super::types::{KVConfig, KVStats, StoredValue};
use crate::replication::message::{
    AddPolicy, AppendPrepend, BackfillRange, BackfillSet, Cas, Delete, GetCas, IncrDecr,
    ReplTimestamp, ReplacePolicy, Sarc, StoreKey,
};
use crate::replication::storage::{
    AppendPrependOutcome, BackfillSnapshot, DeleteOutcome, IncrDecrOutcome, SetOutcome,
    StorageEngine, StoredItem, key_hash,
};
use crate::replication::types::unix_now_secs;
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use radix_trie::{Trie, TrieCommon, TrieKey};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

impl TrieKey for StoreKey {
    fn encode_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

struct StoreState {
    items: Trie<StoreKey, StoredValue>,
    /// Recent deletions, oldest first, for partial backfill
    deletions: VecDeque<Delete>,
    /// Newest timestamp among deletions dropped from `deletions`
    evicted_through: Option<ReplTimestamp>,
    memory_bytes: usize,
}

impl StoreState {
    /// Entry for `key` unless absent or expired; expired entries are dropped
    fn live_entry(&mut self, key: &StoreKey, now: u64) -> Option<&mut StoredValue> {
        if self.items.get(key).is_some_and(|v| v.is_expired(now)) {
            self.remove(key);
            return None;
        }
        self.items.get_mut(key)
    }

    fn insert(&mut self, key: StoreKey, value: StoredValue, max_bytes: usize) -> Result<()> {
        let new_size = entry_size(&key, &value);
        let old_size = self
            .items
            .get(&key)
            .map(|old| entry_size(&key, old))
            .unwrap_or(0);

        let used = self.memory_bytes.saturating_sub(old_size) + new_size;
        if used > max_bytes {
            warn!("Memory limit exceeded: {}/{}", used, max_bytes);
            return Err(StoreError::MemoryLimitExceeded {
                used,
                limit: max_bytes,
            });
        }

        self.items.insert(key, value);
        self.memory_bytes = used;
        Ok(())
    }

    fn remove(&mut self, key: &StoreKey) -> Option<StoredValue> {
        let removed = self.items.remove(key)?;
        self.memory_bytes = self
            .memory_bytes
            .saturating_sub(entry_size(key, &removed));
        Some(removed)
    }

    fn record_deletion(&mut self, deletion: Delete, capacity: usize) {
        self.deletions.push_back(deletion);
        while self.deletions.len() > capacity {
            if let Some(evicted) = self.deletions.pop_front() {
                self.evicted_through = Some(
                    self.evicted_through
                        .map_or(evicted.timestamp, |ts| ts.max(evicted.timestamp)),
                );
            }
        }
    }

    /// Whether every deletion stamped at or after `since` is still remembered
    fn history_covers(&self, since: ReplTimestamp) -> bool {
        self.evicted_through.is_none_or(|evicted| since > evicted)
    }
}

/// Estimate memory size of an entry
fn entry_size(key: &StoreKey, value: &StoredValue) -> usize {
    key.len() + value.data.len() + std::mem::size_of::<StoredValue>()
}

fn parse_counter(data: &[u8]) -> Option<u64> {
    std::str::from_utf8(data).ok()?.trim().parse::<u64>().ok()
}

/// In-memory storage engine backed by a radix trie
#[derive(Clone)]
pub struct KVStore {
    state: Arc<RwLock<StoreState>>,
    stats: Arc<RwLock<KVStats>>,
    config: KVConfig,
    created_at: u32,
}

impl KVStore {
    /// Create a new KV store with the given configuration
    pub fn new(config: KVConfig) -> Self {
        let created_at = u32::try_from(unix_now_secs()).unwrap_or(u32::MAX);
        Self::with_creation_timestamp(config, created_at)
    }

    /// Create a store that reports a fixed database creation time
    pub fn with_creation_timestamp(config: KVConfig, created_at: u32) -> Self {
        info!(
            "Initializing KV store with max_memory={}MB, deletion_history={}, created_at={}",
            config.max_memory_mb, config.deletion_history, created_at
        );

        Self {
            state: Arc::new(RwLock::new(StoreState {
                items: Trie::new(),
                deletions: VecDeque::new(),
                evicted_through: None,
                memory_bytes: 0,
            })),
            stats: Arc::new(RwLock::new(KVStats::default())),
            config,
            created_at,
        }
    }

    /// Start background task removing expired keys
    pub fn start_expiry_cleanup(&self) -> tokio::task::JoinHandle<()> {
        let interval_ms = self.config.expiry_cleanup_interval_ms;
        info!("Starting expiry cleanup task (interval={}ms)", interval_ms);

        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));

            loop {
                interval.tick().await;
                store.cleanup_expired();
            }
        })
    }

    /// All live keys, in key order
    pub fn keys(&self) -> Vec<StoreKey> {
        let now = unix_now_secs();
        let state = self.state.read();
        let mut keys: Vec<StoreKey> = state
            .items
            .iter()
            .filter(|(_, v)| !v.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of stored keys (including not yet collected expired ones)
    pub fn len(&self) -> usize {
        self.state.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get statistics
    pub async fn stats(&self) -> KVStats {
        let (total_keys, total_memory_bytes) = {
            let state = self.state.read();
            (state.items.len(), state.memory_bytes)
        };
        let mut stats = self.stats.read().clone();
        stats.total_keys = total_keys;
        stats.total_memory_bytes = total_memory_bytes;
        stats
    }

    /// Clean up expired keys
    fn cleanup_expired(&self) -> usize {
        let now = unix_now_secs();
        let mut state = self.state.write();

        let expired: Vec<StoreKey> = state
            .items
            .iter()
            .filter(|(_, v)| v.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();

        if !expired.is_empty() {
            debug!("Cleaning up {} expired keys", expired.len());
            for key in &expired {
                state.remove(key);
            }
        }
        expired.len()
    }

    fn max_bytes(&self) -> usize {
        self.config.max_memory_mb.saturating_mul(1024 * 1024)
    }

    fn apply_delta(&self, op: &IncrDecr, increment: bool) -> Result<IncrDecrOutcome> {
        let now = unix_now_secs();
        let mut state = self.state.write();

        let Some(entry) = state.live_entry(&op.key, now) else {
            return Ok(IncrDecrOutcome::NotFound);
        };
        let Some(current) = parse_counter(&entry.data) else {
            return Ok(IncrDecrOutcome::NotNumeric);
        };

        let updated = if increment {
            current.wrapping_add(op.amount)
        } else {
            current.saturating_sub(op.amount)
        };
        let value = StoredValue::new(
            Bytes::from(updated.to_string()),
            entry.flags,
            entry.exptime,
            op.proposed_cas,
            op.timestamp,
        );
        state.insert(op.key.clone(), value, self.max_bytes())?;
        self.stats.write().sets += 1;

        Ok(IncrDecrOutcome::Applied(updated))
    }

    fn splice(&self, op: &AppendPrepend, at_end: bool) -> Result<AppendPrependOutcome> {
        let now = unix_now_secs();
        let mut state = self.state.write();

        let Some(entry) = state.live_entry(&op.key, now) else {
            return Ok(AppendPrependOutcome::NotFound);
        };

        let total = entry.data.len() + op.data.len();
        if total > u32::MAX as usize {
            return Err(StoreError::ValueTooLarge(total));
        }

        let mut data = BytesMut::with_capacity(total);
        if at_end {
            data.extend_from_slice(&entry.data);
            data.extend_from_slice(&op.data);
        } else {
            data.extend_from_slice(&op.data);
            data.extend_from_slice(&entry.data);
        }
        let value = StoredValue::new(
            data.freeze(),
            entry.flags,
            entry.exptime,
            op.proposed_cas,
            op.timestamp,
        );
        state.insert(op.key.clone(), value, self.max_bytes())?;
        self.stats.write().sets += 1;

        Ok(AppendPrependOutcome::Applied)
    }
}

impl StorageEngine for KVStore {
    fn creation_timestamp(&self) -> u32 {
        self.created_at
    }

    async fn get(&self, key: &StoreKey) -> Result<Option<StoredItem>> {
        debug!("GET key={:?}", key);

        let now = unix_now_secs();
        let mut state = self.state.write();
        let mut stats = self.stats.write();
        stats.gets += 1;

        match state.live_entry(key, now) {
            Some(value) => {
                stats.hits += 1;
                Ok(Some(StoredItem {
                    value: value.data.clone(),
                    flags: value.flags,
                    exptime: value.exptime,
                    cas: value.cas,
                    timestamp: value.timestamp,
                }))
            }
            None => {
                stats.misses += 1;
                Ok(None)
            }
        }
    }

    async fn get_cas(&self, op: &GetCas) -> Result<Option<Cas>> {
        let now = unix_now_secs();
        let mut state = self.state.write();

        let Some(entry) = state.live_entry(&op.key, now) else {
            return Ok(None);
        };
        if entry.cas == 0 {
            entry.cas = op.proposed_cas;
            entry.timestamp = op.timestamp;
        }
        Ok(Some(entry.cas))
    }

    async fn conditional_set(&self, op: &Sarc) -> Result<SetOutcome> {
        debug!(
            "SET key={:?}, size={}, add={:?}, replace={:?}",
            op.key,
            op.value.len(),
            op.add_policy,
            op.replace_policy
        );

        let now = unix_now_secs();
        let mut state = self.state.write();

        let outcome = match state.live_entry(&op.key, now) {
            None => match (op.add_policy, op.replace_policy) {
                (AddPolicy::Yes, _) => SetOutcome::Stored,
                (AddPolicy::No, ReplacePolicy::IfCasMatches) => SetOutcome::NotFound,
                (AddPolicy::No, _) => SetOutcome::NotStored,
            },
            Some(existing) => match op.replace_policy {
                ReplacePolicy::Yes => SetOutcome::Stored,
                ReplacePolicy::No => SetOutcome::NotStored,
                ReplacePolicy::IfCasMatches if existing.cas == op.old_cas => SetOutcome::Stored,
                ReplacePolicy::IfCasMatches => SetOutcome::Exists,
            },
        };

        if outcome == SetOutcome::Stored {
            let value = StoredValue::new(
                op.value.clone(),
                op.flags,
                op.exptime,
                op.proposed_cas,
                op.timestamp,
            );
            state.insert(op.key.clone(), value, self.max_bytes())?;
            self.stats.write().sets += 1;
        }

        Ok(outcome)
    }

    async fn incr(&self, op: &IncrDecr) -> Result<IncrDecrOutcome> {
        debug!("INCR key={:?}, amount={}", op.key, op.amount);
        self.apply_delta(op, true)
    }

    async fn decr(&self, op: &IncrDecr) -> Result<IncrDecrOutcome> {
        debug!("DECR key={:?}, amount={}", op.key, op.amount);
        self.apply_delta(op, false)
    }

    async fn append(&self, op: &AppendPrepend) -> Result<AppendPrependOutcome> {
        debug!("APPEND key={:?}, size={}", op.key, op.data.len());
        self.splice(op, true)
    }

    async fn prepend(&self, op: &AppendPrepend) -> Result<AppendPrependOutcome> {
        debug!("PREPEND key={:?}, size={}", op.key, op.data.len());
        self.splice(op, false)
    }

    async fn delete(&self, op: &Delete) -> Result<DeleteOutcome> {
        debug!("DELETE key={:?}", op.key);

        let now = unix_now_secs();
        let mut state = self.state.write();

        if state.live_entry(&op.key, now).is_none() {
            return Ok(DeleteOutcome::NotFound);
        }
        state.remove(&op.key);
        state.record_deletion(op.clone(), self.config.deletion_history);
        self.stats.write().dels += 1;

        Ok(DeleteOutcome::Deleted)
    }

    async fn delete_range(&self, range: &BackfillRange) -> Result<usize> {
        let mut state = self.state.write();

        let doomed: Vec<StoreKey> = state
            .items
            .iter()
            .filter(|(k, _)| range.covers(k.as_bytes(), key_hash(k.as_bytes())))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &doomed {
            state.remove(key);
        }
        self.stats.write().dels += doomed.len() as u64;

        debug!(
            "DELETE_RANGE partition={}/{} removed={}",
            range.hash_value,
            range.hashmod,
            doomed.len()
        );
        Ok(doomed.len())
    }

    async fn backfill_set(&self, entry: &BackfillSet) -> Result<()> {
        let value = StoredValue::new(
            entry.value.clone(),
            entry.flags,
            entry.exptime,
            entry.cas_or_zero,
            entry.timestamp,
        );
        self.state
            .write()
            .insert(entry.key.clone(), value, self.max_bytes())?;
        self.stats.write().sets += 1;
        Ok(())
    }

    async fn backfill_delete(&self, entry: &Delete) -> Result<()> {
        let mut state = self.state.write();
        if state.remove(&entry.key).is_some() {
            self.stats.write().dels += 1;
        }
        state.record_deletion(entry.clone(), self.config.deletion_history);
        Ok(())
    }

    async fn snapshot_for_backfill(&self, since: ReplTimestamp) -> Result<BackfillSnapshot> {
        let now = unix_now_secs();
        let state = self.state.read();

        let full = since == ReplTimestamp::DISTANT_PAST || !state.history_covers(since);
        let mut snapshot = BackfillSnapshot::default();

        if full {
            let partitions = self.config.backfill_partitions.max(1);
            snapshot.range_tombstones = (0..partitions)
                .map(|p| BackfillRange::unbounded(p, partitions))
                .collect();
        } else {
            // Newest deletion per key, skipping keys that are live again
            let mut seen = HashSet::new();
            for deletion in state.deletions.iter().rev() {
                if deletion.timestamp < since || !seen.insert(deletion.key.clone()) {
                    continue;
                }
                let live = state
                    .items
                    .get(&deletion.key)
                    .is_some_and(|v| !v.is_expired(now));
                if !live {
                    snapshot.deletions.push(deletion.clone());
                }
            }
            snapshot.deletions.reverse();
        }

        for (key, value) in state.items.iter() {
            if value.is_expired(now) || (!full && value.timestamp < since) {
                continue;
            }
            snapshot.items.push(BackfillSet {
                timestamp: value.timestamp,
                flags: value.flags,
                exptime: value.exptime,
                cas_or_zero: value.cas,
                key: key.clone(),
                value: value.data.clone(),
            });
        }

        info!(
            "Backfill snapshot since {}: full={}, tombstones={}, deletions={}, items={}",
            since,
            full,
            snapshot.range_tombstones.len(),
            snapshot.deletions.len(),
            snapshot.items.len()
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> StoreKey {
        StoreKey::try_from(s).unwrap()
    }

    fn ts(v: u32) -> ReplTimestamp {
        ReplTimestamp::new(v)
    }

    fn set_op(k: &str, v: &str, cas: Cas, t: u32) -> Sarc {
        Sarc {
            timestamp: ts(t),
            proposed_cas: cas,
            flags: 0,
            exptime: 0,
            add_policy: AddPolicy::Yes,
            replace_policy: ReplacePolicy::Yes,
            old_cas: 0,
            key: key(k),
            value: Bytes::copy_from_slice(v.as_bytes()),
        }
    }

    fn delete_op(k: &str, t: u32) -> Delete {
        Delete {
            timestamp: ts(t),
            key: key(k),
        }
    }

    #[tokio::test]
    async fn test_set_get() {
        let store = KVStore::new(KVConfig::default());

        let outcome = store.conditional_set(&set_op("key1", "value1", 10, 1)).await.unwrap();
        assert_eq!(outcome, SetOutcome::Stored);

        let item = store.get(&key("key1")).await.unwrap().unwrap();
        assert_eq!(item.value, Bytes::from_static(b"value1"));
        assert_eq!(item.cas, 10);
        assert_eq!(item.timestamp, ts(1));
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let store = KVStore::new(KVConfig::default());
        assert_eq!(store.get(&key("nonexistent")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_add_and_replace_policies() {
        let store = KVStore::new(KVConfig::default());

        let mut replace = set_op("k", "v", 1, 1);
        replace.add_policy = AddPolicy::No;
        assert_eq!(store.conditional_set(&replace).await.unwrap(), SetOutcome::NotStored);

        let mut add = set_op("k", "v", 2, 1);
        add.replace_policy = ReplacePolicy::No;
        assert_eq!(store.conditional_set(&add).await.unwrap(), SetOutcome::Stored);
        add.proposed_cas = 3;
        assert_eq!(store.conditional_set(&add).await.unwrap(), SetOutcome::NotStored);

        assert_eq!(store.conditional_set(&replace).await.unwrap(), SetOutcome::Stored);
    }

    #[tokio::test]
    async fn test_cas_policy() {
        let store = KVStore::new(KVConfig::default());

        let mut cas = set_op("k", "v2", 20, 2);
        cas.add_policy = AddPolicy::No;
        cas.replace_policy = ReplacePolicy::IfCasMatches;
        cas.old_cas = 10;
        assert_eq!(store.conditional_set(&cas).await.unwrap(), SetOutcome::NotFound);

        store.conditional_set(&set_op("k", "v1", 10, 1)).await.unwrap();
        assert_eq!(store.conditional_set(&cas).await.unwrap(), SetOutcome::Stored);

        // old_cas 10 no longer current
        cas.proposed_cas = 30;
        assert_eq!(store.conditional_set(&cas).await.unwrap(), SetOutcome::Exists);
        assert_eq!(store.get(&key("k")).await.unwrap().unwrap().cas, 20);
    }

    #[tokio::test]
    async fn test_get_cas_assigns_once() {
        let store = KVStore::new(KVConfig::default());
        store.conditional_set(&set_op("k", "v", 0, 1)).await.unwrap();

        let op = GetCas {
            proposed_cas: 7,
            timestamp: ts(2),
            key: key("k"),
        };
        assert_eq!(store.get_cas(&op).await.unwrap(), Some(7));

        let again = GetCas {
            proposed_cas: 8,
            ..op
        };
        assert_eq!(store.get_cas(&again).await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_incr_decr() {
        let store = KVStore::new(KVConfig::default());
        let op = |amount, cas| IncrDecr {
            timestamp: ts(1),
            proposed_cas: cas,
            amount,
            key: key("counter"),
        };

        assert_eq!(store.incr(&op(1, 1)).await.unwrap(), IncrDecrOutcome::NotFound);

        store.conditional_set(&set_op("counter", "10", 1, 1)).await.unwrap();
        assert_eq!(store.incr(&op(5, 2)).await.unwrap(), IncrDecrOutcome::Applied(15));
        assert_eq!(store.decr(&op(3, 3)).await.unwrap(), IncrDecrOutcome::Applied(12));
        assert_eq!(store.decr(&op(100, 4)).await.unwrap(), IncrDecrOutcome::Applied(0));

        let item = store.get(&key("counter")).await.unwrap().unwrap();
        assert_eq!(item.value, Bytes::from_static(b"0"));
        assert_eq!(item.cas, 4);
    }

    #[tokio::test]
    async fn test_incr_non_numeric() {
        let store = KVStore::new(KVConfig::default());
        store.conditional_set(&set_op("k", "abc", 1, 1)).await.unwrap();

        let op = IncrDecr {
            timestamp: ts(1),
            proposed_cas: 2,
            amount: 1,
            key: key("k"),
        };
        assert_eq!(store.incr(&op).await.unwrap(), IncrDecrOutcome::NotNumeric);
        assert_eq!(store.get(&key("k")).await.unwrap().unwrap().cas, 1);
    }

    #[tokio::test]
    async fn test_append_prepend() {
        let store = KVStore::new(KVConfig::default());
        let op = |data: &'static [u8], cas| AppendPrepend {
            timestamp: ts(1),
            proposed_cas: cas,
            key: key("k"),
            data: Bytes::from_static(data),
        };

        assert_eq!(store.append(&op(b"x", 1)).await.unwrap(), AppendPrependOutcome::NotFound);

        store.conditional_set(&set_op("k", "mid", 1, 1)).await.unwrap();
        store.append(&op(b">>", 2)).await.unwrap();
        store.prepend(&op(b"<<", 3)).await.unwrap();

        let item = store.get(&key("k")).await.unwrap().unwrap();
        assert_eq!(item.value, Bytes::from_static(b"<<mid>>"));
        assert_eq!(item.cas, 3);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = KVStore::new(KVConfig::default());
        store.conditional_set(&set_op("key1", "value1", 1, 1)).await.unwrap();

        assert_eq!(store.delete(&delete_op("key1", 2)).await.unwrap(), DeleteOutcome::Deleted);
        assert_eq!(store.delete(&delete_op("key1", 3)).await.unwrap(), DeleteOutcome::NotFound);
        assert_eq!(store.get(&key("key1")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_value_is_absent() {
        let store = KVStore::new(KVConfig::default());
        let mut op = set_op("k", "v", 1, 1);
        op.exptime = 1; // long gone
        store.conditional_set(&op).await.unwrap();

        assert_eq!(store.get(&key("k")).await.unwrap(), None);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_delete_range_respects_partition_and_bounds() {
        let store = KVStore::new(KVConfig::default());
        for (i, k) in ["a", "b", "c", "d"].iter().enumerate() {
            store.conditional_set(&set_op(k, "v", i as u64 + 1, 1)).await.unwrap();
        }

        let range = BackfillRange {
            hash_value: 0,
            hashmod: 1,
            low_key: crate::replication::message::KeyBound::Key(key("a")),
            high_key: crate::replication::message::KeyBound::Key(key("c")),
        };
        assert_eq!(store.delete_range(&range).await.unwrap(), 2);
        assert_eq!(store.keys(), vec![key("a"), key("d")]);

        // Two partitions together cover everything
        let first = store.delete_range(&BackfillRange::unbounded(0, 2)).await.unwrap();
        let second = store.delete_range(&BackfillRange::unbounded(1, 2)).await.unwrap();
        assert_eq!(first + second, 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_full_snapshot() {
        let store = KVStore::new(KVConfig::default());
        store.conditional_set(&set_op("a", "1", 1, 1)).await.unwrap();
        store.conditional_set(&set_op("b", "2", 2, 2)).await.unwrap();

        let snapshot = store
            .snapshot_for_backfill(ReplTimestamp::DISTANT_PAST)
            .await
            .unwrap();
        assert_eq!(snapshot.range_tombstones, vec![BackfillRange::unbounded(0, 1)]);
        assert!(snapshot.deletions.is_empty());
        assert_eq!(snapshot.items.len(), 2);
    }

    #[tokio::test]
    async fn test_partial_snapshot() {
        let store = KVStore::new(KVConfig::default());
        store.conditional_set(&set_op("old", "1", 1, 1)).await.unwrap();
        store.conditional_set(&set_op("gone", "1", 2, 1)).await.unwrap();
        store.conditional_set(&set_op("back", "1", 3, 1)).await.unwrap();
        store.conditional_set(&set_op("new", "2", 4, 5)).await.unwrap();
        store.delete(&delete_op("gone", 5)).await.unwrap();
        store.delete(&delete_op("back", 5)).await.unwrap();
        store.conditional_set(&set_op("back", "3", 5, 6)).await.unwrap();

        let snapshot = store.snapshot_for_backfill(ts(5)).await.unwrap();
        assert!(snapshot.range_tombstones.is_empty());
        assert_eq!(snapshot.deletions, vec![delete_op("gone", 5)]);

        let mut keys: Vec<_> = snapshot.items.iter().map(|i| i.key.clone()).collect();
        keys.sort();
        assert_eq!(keys, vec![key("back"), key("new")]);
    }

    #[tokio::test]
    async fn test_evicted_history_forces_full_snapshot() {
        let config = KVConfig {
            deletion_history: 1,
            ..Default::default()
        };
        let store = KVStore::new(config);
        store.conditional_set(&set_op("a", "1", 1, 1)).await.unwrap();
        store.conditional_set(&set_op("b", "1", 2, 1)).await.unwrap();
        store.delete(&delete_op("a", 3)).await.unwrap();
        store.delete(&delete_op("b", 4)).await.unwrap();

        // Deletion of "a" at t3 was evicted
        let snapshot = store.snapshot_for_backfill(ts(2)).await.unwrap();
        assert_eq!(snapshot.range_tombstones.len(), 1);

        let snapshot = store.snapshot_for_backfill(ts(4)).await.unwrap();
        assert!(snapshot.range_tombstones.is_empty());
        assert_eq!(snapshot.deletions, vec![delete_op("b", 4)]);
    }

    #[tokio::test]
    async fn test_memory_limit() {
        let config = KVConfig {
            max_memory_mb: 0,
            ..Default::default()
        };
        let store = KVStore::new(config);

        let err = store.conditional_set(&set_op("k", "v", 1, 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::MemoryLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn test_stats() {
        let store = KVStore::new(KVConfig::default());

        store.conditional_set(&set_op("key1", "value1", 1, 1)).await.unwrap();
        store.get(&key("key1")).await.unwrap();
        store.get(&key("key2")).await.unwrap();

        let stats = store.stats().await;
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.gets, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.total_keys, 1);
        assert!(stats.total_memory_bytes > 0);
    }
}
