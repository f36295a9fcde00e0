//! Master-side replication clock and CAS generator

use super::message::{Cas, ReplTimestamp};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Logical clock stamped on every mutation emitted by a master
///
/// Only advanced by time barriers and backfill snapshots, which the master
/// serializes with its writes, so stamps are non-decreasing in emission order.
#[derive(Debug)]
pub struct ReplicationClock {
    current: AtomicU32,
}

impl ReplicationClock {
    /// Start just after [`ReplTimestamp::DISTANT_PAST`]
    pub fn new() -> Self {
        Self::starting_at(ReplTimestamp::DISTANT_PAST.next())
    }

    pub fn starting_at(start: ReplTimestamp) -> Self {
        Self {
            current: AtomicU32::new(start.get()),
        }
    }

    /// Timestamp for the next mutation
    pub fn now(&self) -> ReplTimestamp {
        ReplTimestamp::new(self.current.load(Ordering::SeqCst))
    }

    /// Move to the next timestamp and return it
    pub fn advance(&self) -> ReplTimestamp {
        let previous = self
            .current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                Some(t.saturating_add(1))
            })
            .unwrap_or(u32::MAX);
        ReplTimestamp::new(previous.saturating_add(1))
    }
}

impl Default for ReplicationClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Source of strictly increasing CAS values proposed by the master
#[derive(Debug)]
pub struct CasGenerator {
    next: AtomicU64,
}

impl CasGenerator {
    /// Seed from the database creation time so CAS values of different
    /// databases rarely collide
    pub fn seeded(database_creation_timestamp: u32) -> Self {
        Self {
            next: AtomicU64::new(((database_creation_timestamp as u64) << 32) | 1),
        }
    }

    pub fn next(&self) -> Cas {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}
