//! Backfill stream production (master) and consumption (slave)
//!
//! The producer turns a [`BackfillSnapshot`] into an ordered message stream:
//! range tombstones, then individual deletions, then point entries, then a
//! single `BackfillComplete` carrying the time barrier. A tombstone therefore
//! never follows the point entry of a key that is live at the barrier.
//!
//! The consumer applies entries in arrival order (the last entry for a key
//! wins) and holds back live messages until the barrier is known.

use super::apply::{ApplyOutcome, apply_live};
use super::message::{BackfillRange, BackfillSet, Delete, Message, ReplTimestamp};
use super::session::SessionPhase;
use super::storage::{BackfillSnapshot, StorageEngine};
use super::types::{ReplicationError, ReplicationResult};
use std::vec;
use tracing::{debug, info};

/// Iterator over the backfill stream of one snapshot
#[derive(Debug)]
pub struct BackfillProducer {
    tombstones: vec::IntoIter<BackfillRange>,
    deletions: vec::IntoIter<Delete>,
    items: vec::IntoIter<BackfillSet>,
    time_barrier: ReplTimestamp,
    completed: bool,
}

impl BackfillProducer {
    pub fn new(snapshot: BackfillSnapshot, time_barrier: ReplTimestamp) -> Self {
        Self {
            tombstones: snapshot.range_tombstones.into_iter(),
            deletions: snapshot.deletions.into_iter(),
            items: snapshot.items.into_iter(),
            time_barrier,
            completed: false,
        }
    }

    pub fn time_barrier(&self) -> ReplTimestamp {
        self.time_barrier
    }

    /// Messages left, completion marker included
    pub fn remaining(&self) -> usize {
        self.tombstones.len()
            + self.deletions.len()
            + self.items.len()
            + usize::from(!self.completed)
    }
}

impl Iterator for BackfillProducer {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        if let Some(range) = self.tombstones.next() {
            return Some(Message::BackfillDeleteRange(range));
        }
        if let Some(deletion) = self.deletions.next() {
            return Some(Message::BackfillDelete(deletion));
        }
        if let Some(item) = self.items.next() {
            return Some(Message::BackfillSet(item));
        }
        if !self.completed {
            self.completed = true;
            return Some(Message::BackfillComplete {
                time_barrier: self.time_barrier,
            });
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for BackfillProducer {}

/// Result of finishing a backfill on the slave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackfillReport {
    /// Backfill entries applied
    pub entries: u64,
    /// Keys removed by range tombstones
    pub range_deleted: u64,
    /// Buffered live messages replayed after the barrier
    pub replayed: u64,
    /// Buffered live messages already covered by the backfill
    pub discarded: u64,
    /// Replayed mutations whose condition failed
    pub condition_failures: u64,
    /// Newest barrier known to be fully applied
    pub last_barrier: ReplTimestamp,
}

/// Slave side of a backfill
#[derive(Debug)]
pub struct BackfillConsumer {
    buffer: Vec<Message>,
    buffer_limit: usize,
    entries: u64,
    range_deleted: u64,
}

impl BackfillConsumer {
    pub fn new(buffer_limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            buffer_limit,
            entries: 0,
            range_deleted: 0,
        }
    }

    /// Live messages currently held back
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn entries_applied(&self) -> u64 {
        self.entries
    }

    /// Apply one backfill entry unconditionally
    pub async fn apply_entry<S: StorageEngine>(
        &mut self,
        storage: &S,
        msg: &Message,
    ) -> ReplicationResult<()> {
        match msg {
            Message::BackfillSet(entry) => storage.backfill_set(entry).await?,
            Message::BackfillDelete(entry) => storage.backfill_delete(entry).await?,
            Message::BackfillDeleteRange(range) => {
                let removed = storage.delete_range(range).await?;
                self.range_deleted += removed as u64;
            }
            other => {
                return Err(ReplicationError::UnexpectedMessage {
                    kind: other.kind(),
                    phase: SessionPhase::Backfilling,
                });
            }
        }
        self.entries += 1;
        Ok(())
    }

    /// Hold a live message until the time barrier is known
    pub fn buffer_live(&mut self, msg: Message) -> ReplicationResult<()> {
        if self.buffer.len() >= self.buffer_limit {
            return Err(ReplicationError::BackfillBufferOverflow(self.buffer_limit));
        }
        self.buffer.push(msg);
        Ok(())
    }

    /// Finish the backfill at `time_barrier`
    ///
    /// Buffered messages stamped at or after the barrier are replayed in the
    /// order received; older ones are already reflected by the backfill and
    /// are dropped. The buffer is released either way.
    pub async fn complete<S: StorageEngine>(
        &mut self,
        storage: &S,
        time_barrier: ReplTimestamp,
    ) -> ReplicationResult<BackfillReport> {
        let buffered = std::mem::take(&mut self.buffer);
        let mut report = BackfillReport {
            entries: self.entries,
            range_deleted: self.range_deleted,
            last_barrier: time_barrier,
            ..Default::default()
        };

        for msg in buffered {
            let Some(timestamp) = msg.live_timestamp() else {
                continue;
            };
            if timestamp < time_barrier {
                debug!("Discarding {} stamped {} below barrier", msg.kind(), timestamp);
                report.discarded += 1;
                continue;
            }

            if let Message::TimeBarrier { timestamp } = msg {
                report.last_barrier = report.last_barrier.max(timestamp);
            }
            match apply_live(storage, &msg).await? {
                ApplyOutcome::Applied => {}
                ApplyOutcome::ConditionFailed(reason) => {
                    debug!("Replayed {} not applied: {}", msg.kind(), reason);
                    report.condition_failures += 1;
                }
            }
            report.replayed += 1;
        }

        info!(
            "Backfill complete at {}: entries={}, range_deleted={}, replayed={}, discarded={}",
            time_barrier, report.entries, report.range_deleted, report.replayed, report.discarded
        );
        Ok(report)
    }

    /// Drop anything still buffered, e.g. when the session dies mid-backfill
    pub fn abort(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer = Vec::new();
        dropped
    }
}
