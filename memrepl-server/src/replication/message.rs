//! Replication message model
//!
//! Every mutation and control message exchanged between a master and a
//! slave is one variant of [`Message`]. Variants own their scalar fields and,
//! where applicable, the trailing key/value payload.

use bytes::Bytes;
use std::fmt;

/// Longest key accepted by the store and by the wire format
pub const MAX_KEY_SIZE: usize = 250;

/// Logical replication clock value
///
/// Assigned by the master; non-decreasing in emission order. Wraps a 32-bit
/// counter on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ReplTimestamp(u32);

impl ReplTimestamp {
    /// The earliest timestamp; a slave with no history asks for backfill from here
    pub const DISTANT_PAST: ReplTimestamp = ReplTimestamp(0);

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// The timestamp immediately after this one
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for ReplTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Version token of a stored value
pub type Cas = u64;

/// Validated store key (at most [`MAX_KEY_SIZE`] bytes, arbitrary content)
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StoreKey(Vec<u8>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("key of {0} bytes exceeds the 250 byte limit")]
pub struct KeyTooLong(pub usize);

impl StoreKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, KeyTooLong> {
        let bytes = bytes.into();
        if bytes.len() > MAX_KEY_SIZE {
            return Err(KeyTooLong(bytes.len()));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl TryFrom<&str> for StoreKey {
    type Error = KeyTooLong;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value.as_bytes())
    }
}

impl TryFrom<&[u8]> for StoreKey {
    type Error = KeyTooLong;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl AsRef<[u8]> for StoreKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreKey({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// One side of a delete-range key bound
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyBound {
    /// No restriction in this direction (the infinity sentinel on the wire)
    Unbounded,
    Key(StoreKey),
}

impl KeyBound {
    pub fn is_unbounded(&self) -> bool {
        matches!(self, KeyBound::Unbounded)
    }
}

/// Behavior of a set when the key is absent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddPolicy {
    Yes,
    No,
}

/// Behavior of a set when the key is present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacePolicy {
    Yes,
    No,
    IfCasMatches,
}

/// Assign a CAS to a value that was read with `gets`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetCas {
    pub proposed_cas: Cas,
    pub timestamp: ReplTimestamp,
    pub key: StoreKey,
}

/// Set-with-CAS ("sarc"): conditional store covering set/add/replace/cas
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sarc {
    pub timestamp: ReplTimestamp,
    pub proposed_cas: Cas,
    pub flags: u32,
    pub exptime: u32,
    pub add_policy: AddPolicy,
    pub replace_policy: ReplacePolicy,
    /// Only consulted when `replace_policy` is `IfCasMatches`
    pub old_cas: Cas,
    pub key: StoreKey,
    pub value: Bytes,
}

/// Authoritative current value of a key, sent during backfill
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillSet {
    pub timestamp: ReplTimestamp,
    pub flags: u32,
    pub exptime: u32,
    /// Zero when the value never had a CAS assigned
    pub cas_or_zero: Cas,
    pub key: StoreKey,
    pub value: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrDecr {
    pub timestamp: ReplTimestamp,
    pub proposed_cas: Cas,
    pub amount: u64,
    pub key: StoreKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendPrepend {
    pub timestamp: ReplTimestamp,
    pub proposed_cas: Cas,
    pub key: StoreKey,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delete {
    pub timestamp: ReplTimestamp,
    pub key: StoreKey,
}

/// Range tombstone: every key in partition `hash_value` of `hashmod` whose
/// key lies in `(low_key, high_key]` was deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillRange {
    pub hash_value: u32,
    pub hashmod: u32,
    pub low_key: KeyBound,
    pub high_key: KeyBound,
}

impl BackfillRange {
    /// Tombstone for a whole partition
    pub fn unbounded(hash_value: u32, hashmod: u32) -> Self {
        Self {
            hash_value,
            hashmod,
            low_key: KeyBound::Unbounded,
            high_key: KeyBound::Unbounded,
        }
    }

    /// Check whether a key (already hashed) falls inside this range
    pub fn covers(&self, key: &[u8], key_hash: u32) -> bool {
        if self.hashmod == 0 || key_hash % self.hashmod != self.hash_value {
            return false;
        }
        let above_low = match &self.low_key {
            KeyBound::Unbounded => true,
            KeyBound::Key(low) => key > low.as_bytes(),
        };
        let below_high = match &self.high_key {
            KeyBound::Unbounded => true,
            KeyBound::Key(high) => key <= high.as_bytes(),
        };
        above_low && below_high
    }
}

/// Every message kind of the replication protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello {
        protocol_version: u32,
    },
    Introduce {
        database_creation_timestamp: u32,
        peer_node_id: u32,
    },
    Backfill {
        since: ReplTimestamp,
    },
    BackfillComplete {
        time_barrier: ReplTimestamp,
    },
    TimeBarrier {
        timestamp: ReplTimestamp,
    },
    Heartbeat,
    GetCas(GetCas),
    Sarc(Sarc),
    BackfillSet(BackfillSet),
    Incr(IncrDecr),
    Decr(IncrDecr),
    Append(AppendPrepend),
    Prepend(AppendPrepend),
    Delete(Delete),
    BackfillDeleteRange(BackfillRange),
    BackfillDelete(Delete),
}

/// Wire tag of each message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Hello = 1,
    Introduce = 2,
    Backfill = 3,
    BackfillComplete = 4,
    TimeBarrier = 5,
    Heartbeat = 6,
    GetCas = 7,
    Sarc = 8,
    BackfillSet = 9,
    Incr = 10,
    Decr = 11,
    Append = 12,
    Prepend = 13,
    Delete = 14,
    BackfillDeleteRange = 15,
    BackfillDelete = 16,
}

impl MessageKind {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        let kind = match tag {
            1 => Self::Hello,
            2 => Self::Introduce,
            3 => Self::Backfill,
            4 => Self::BackfillComplete,
            5 => Self::TimeBarrier,
            6 => Self::Heartbeat,
            7 => Self::GetCas,
            8 => Self::Sarc,
            9 => Self::BackfillSet,
            10 => Self::Incr,
            11 => Self::Decr,
            12 => Self::Append,
            13 => Self::Prepend,
            14 => Self::Delete,
            15 => Self::BackfillDeleteRange,
            16 => Self::BackfillDelete,
            _ => return None,
        };
        Some(kind)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::Introduce => "INTRODUCE",
            Self::Backfill => "BACKFILL",
            Self::BackfillComplete => "BACKFILL_COMPLETE",
            Self::TimeBarrier => "TIME_BARRIER",
            Self::Heartbeat => "HEARTBEAT",
            Self::GetCas => "GET_CAS",
            Self::Sarc => "SARC",
            Self::BackfillSet => "BACKFILL_SET",
            Self::Incr => "INCR",
            Self::Decr => "DECR",
            Self::Append => "APPEND",
            Self::Prepend => "PREPEND",
            Self::Delete => "DELETE",
            Self::BackfillDeleteRange => "BACKFILL_DELETE_RANGE",
            Self::BackfillDelete => "BACKFILL_DELETE",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello { .. } => MessageKind::Hello,
            Message::Introduce { .. } => MessageKind::Introduce,
            Message::Backfill { .. } => MessageKind::Backfill,
            Message::BackfillComplete { .. } => MessageKind::BackfillComplete,
            Message::TimeBarrier { .. } => MessageKind::TimeBarrier,
            Message::Heartbeat => MessageKind::Heartbeat,
            Message::GetCas(_) => MessageKind::GetCas,
            Message::Sarc(_) => MessageKind::Sarc,
            Message::BackfillSet(_) => MessageKind::BackfillSet,
            Message::Incr(_) => MessageKind::Incr,
            Message::Decr(_) => MessageKind::Decr,
            Message::Append(_) => MessageKind::Append,
            Message::Prepend(_) => MessageKind::Prepend,
            Message::Delete(_) => MessageKind::Delete,
            Message::BackfillDeleteRange(_) => MessageKind::BackfillDeleteRange,
            Message::BackfillDelete(_) => MessageKind::BackfillDelete,
        }
    }

    /// Timestamp carried by live mutations and time barriers
    ///
    /// This is what a slave compares against the backfill time barrier to
    /// decide whether a message received during backfill is redundant.
    pub fn live_timestamp(&self) -> Option<ReplTimestamp> {
        match self {
            Message::GetCas(m) => Some(m.timestamp),
            Message::Sarc(m) => Some(m.timestamp),
            Message::Incr(m) | Message::Decr(m) => Some(m.timestamp),
            Message::Append(m) | Message::Prepend(m) => Some(m.timestamp),
            Message::Delete(m) => Some(m.timestamp),
            Message::TimeBarrier { timestamp } => Some(*timestamp),
            _ => None,
        }
    }

    /// Live mutation (or time barrier) that follows the master's emission order
    pub fn is_live(&self) -> bool {
        self.live_timestamp().is_some()
    }

    /// Entry of the backfill stream (points, tombstones, completion marker)
    pub fn is_backfill_entry(&self) -> bool {
        matches!(
            self,
            Message::BackfillSet(_)
                | Message::BackfillDelete(_)
                | Message::BackfillDeleteRange(_)
                | Message::BackfillComplete { .. }
        )
    }

    /// Key targeted by this message, if any
    pub fn key(&self) -> Option<&StoreKey> {
        match self {
            Message::GetCas(m) => Some(&m.key),
            Message::Sarc(m) => Some(&m.key),
            Message::BackfillSet(m) => Some(&m.key),
            Message::Incr(m) | Message::Decr(m) => Some(&m.key),
            Message::Append(m) | Message::Prepend(m) => Some(&m.key),
            Message::Delete(m) | Message::BackfillDelete(m) => Some(&m.key),
            _ => None,
        }
    }
}
