//! Binary codec for replication messages
//!
//! Layout: `tag: u8`, then the kind-specific scalar header in a fixed field
//! order (little-endian, fixed width), then the variable fields. A key is a
//! `u8` length followed by the key bytes; a value is a `u32` length followed
//! by the value bytes. Delete-range bounds reuse the key encoding with the
//! reserved length [`INFINITY_KEY_SIZE`] standing for an unbounded side.
//!
//! Decoding never trusts a length field: every read is checked against the
//! remaining input before any bytes are sliced or allocated.

use super::message::{
    AddPolicy, AppendPrepend, BackfillRange, BackfillSet, Delete, GetCas, IncrDecr, KeyBound,
    MAX_KEY_SIZE, Message, MessageKind, ReplTimestamp, ReplacePolicy, Sarc, StoreKey,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Key length reserved for "no bound in this direction"
pub const INFINITY_KEY_SIZE: u8 = u8::MAX;

/// Codec and framing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("truncated message: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("unknown message kind: {0}")]
    UnknownKind(u8),

    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: u64 },

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    FrameTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
}

impl ProtocolError {
    /// Short stable identifier for logs
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Truncated { .. } => "truncated",
            Self::UnknownKind(_) => "unknown_kind",
            Self::InvalidField { .. } => "invalid_field",
            Self::TrailingBytes(_) => "trailing_bytes",
            Self::FrameTooLarge { .. } => "frame_too_large",
        }
    }
}

pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Encode a message into a fresh buffer
pub fn encode(msg: &Message) -> ProtocolResult<Bytes> {
    let mut buf = BytesMut::with_capacity(encoded_len(msg));
    encode_into(msg, &mut buf)?;
    Ok(buf.freeze())
}

/// Exact number of bytes [`encode`] produces for `msg`
pub fn encoded_len(msg: &Message) -> usize {
    let key = |k: &StoreKey| 1 + k.len();
    let value = |v: &Bytes| 4 + v.len();
    let bound = |b: &KeyBound| match b {
        KeyBound::Unbounded => 1,
        KeyBound::Key(k) => key(k),
    };

    1 + match msg {
        Message::Hello { .. } => 4,
        Message::Introduce { .. } => 8,
        Message::Backfill { .. } => 4,
        Message::BackfillComplete { .. } => 4,
        Message::TimeBarrier { .. } => 4,
        Message::Heartbeat => 0,
        Message::GetCas(m) => 8 + 4 + key(&m.key),
        Message::Sarc(m) => 4 + 8 + 4 + 4 + 1 + 1 + 8 + key(&m.key) + value(&m.value),
        Message::BackfillSet(m) => 4 + 4 + 4 + 8 + key(&m.key) + value(&m.value),
        Message::Incr(m) | Message::Decr(m) => 4 + 8 + 8 + key(&m.key),
        Message::Append(m) | Message::Prepend(m) => 4 + 8 + key(&m.key) + value(&m.data),
        Message::Delete(m) | Message::BackfillDelete(m) => 4 + key(&m.key),
        Message::BackfillDeleteRange(m) => 4 + 4 + bound(&m.low_key) + bound(&m.high_key),
    }
}

/// Encoded length of a `BackfillSet` carrying `key` and a value of `value_len` bytes
pub fn backfill_set_len(key: &StoreKey, value_len: usize) -> usize {
    1 + 4 + 4 + 4 + 8 + 1 + key.len() + 4 + value_len
}

/// Append the encoding of `msg` to `buf`
///
/// Fails without leaving partial output in `buf` if a value does not fit
/// its `u32` length prefix.
pub fn encode_into(msg: &Message, buf: &mut BytesMut) -> ProtocolResult<()> {
    let start = buf.len();
    let result = put_message(msg, buf);
    if result.is_err() {
        buf.truncate(start);
    }
    result
}

fn put_message(msg: &Message, buf: &mut BytesMut) -> ProtocolResult<()> {
    buf.reserve(encoded_len(msg));
    buf.put_u8(msg.kind().tag());

    match msg {
        Message::Hello { protocol_version } => buf.put_u32_le(*protocol_version),
        Message::Introduce {
            database_creation_timestamp,
            peer_node_id,
        } => {
            buf.put_u32_le(*database_creation_timestamp);
            buf.put_u32_le(*peer_node_id);
        }
        Message::Backfill { since } => put_timestamp(buf, *since),
        Message::BackfillComplete { time_barrier } => put_timestamp(buf, *time_barrier),
        Message::TimeBarrier { timestamp } => put_timestamp(buf, *timestamp),
        Message::Heartbeat => {}
        Message::GetCas(m) => {
            buf.put_u64_le(m.proposed_cas);
            put_timestamp(buf, m.timestamp);
            put_key(buf, &m.key);
        }
        Message::Sarc(m) => {
            put_timestamp(buf, m.timestamp);
            buf.put_u64_le(m.proposed_cas);
            buf.put_u32_le(m.flags);
            buf.put_u32_le(m.exptime);
            buf.put_u8(add_policy_byte(m.add_policy));
            buf.put_u8(replace_policy_byte(m.replace_policy));
            buf.put_u64_le(m.old_cas);
            put_key(buf, &m.key);
            put_value(buf, &m.value)?;
        }
        Message::BackfillSet(m) => {
            put_timestamp(buf, m.timestamp);
            buf.put_u32_le(m.flags);
            buf.put_u32_le(m.exptime);
            buf.put_u64_le(m.cas_or_zero);
            put_key(buf, &m.key);
            put_value(buf, &m.value)?;
        }
        Message::Incr(m) | Message::Decr(m) => {
            put_timestamp(buf, m.timestamp);
            buf.put_u64_le(m.proposed_cas);
            buf.put_u64_le(m.amount);
            put_key(buf, &m.key);
        }
        Message::Append(m) | Message::Prepend(m) => {
            put_timestamp(buf, m.timestamp);
            buf.put_u64_le(m.proposed_cas);
            put_key(buf, &m.key);
            put_value(buf, &m.data)?;
        }
        Message::Delete(m) | Message::BackfillDelete(m) => {
            put_timestamp(buf, m.timestamp);
            put_key(buf, &m.key);
        }
        Message::BackfillDeleteRange(m) => {
            buf.put_u32_le(m.hash_value);
            buf.put_u32_le(m.hashmod);
            put_bound(buf, &m.low_key);
            put_bound(buf, &m.high_key);
        }
    }
    Ok(())
}

/// Decode exactly one message from `bytes`
///
/// Value payloads are sliced out of `bytes` without copying.
pub fn decode(bytes: impl Into<Bytes>) -> ProtocolResult<Message> {
    let mut buf: Bytes = bytes.into();
    let msg = decode_from(&mut buf)?;
    if buf.has_remaining() {
        return Err(ProtocolError::TrailingBytes(buf.remaining()));
    }
    Ok(msg)
}

/// Decode one message from the front of `buf`, advancing past it
pub fn decode_from<B: Buf>(buf: &mut B) -> ProtocolResult<Message> {
    let mut r = Reader { buf };
    let tag = r.u8()?;
    let kind = MessageKind::from_tag(tag).ok_or(ProtocolError::UnknownKind(tag))?;

    let msg = match kind {
        MessageKind::Hello => Message::Hello {
            protocol_version: r.u32()?,
        },
        MessageKind::Introduce => Message::Introduce {
            database_creation_timestamp: r.u32()?,
            peer_node_id: r.u32()?,
        },
        MessageKind::Backfill => Message::Backfill {
            since: r.timestamp()?,
        },
        MessageKind::BackfillComplete => Message::BackfillComplete {
            time_barrier: r.timestamp()?,
        },
        MessageKind::TimeBarrier => Message::TimeBarrier {
            timestamp: r.timestamp()?,
        },
        MessageKind::Heartbeat => Message::Heartbeat,
        MessageKind::GetCas => Message::GetCas(GetCas {
            proposed_cas: r.u64()?,
            timestamp: r.timestamp()?,
            key: r.key()?,
        }),
        MessageKind::Sarc => Message::Sarc(Sarc {
            timestamp: r.timestamp()?,
            proposed_cas: r.u64()?,
            flags: r.u32()?,
            exptime: r.u32()?,
            add_policy: r.add_policy()?,
            replace_policy: r.replace_policy()?,
            old_cas: r.u64()?,
            key: r.key()?,
            value: r.value()?,
        }),
        MessageKind::BackfillSet => Message::BackfillSet(BackfillSet {
            timestamp: r.timestamp()?,
            flags: r.u32()?,
            exptime: r.u32()?,
            cas_or_zero: r.u64()?,
            key: r.key()?,
            value: r.value()?,
        }),
        MessageKind::Incr => Message::Incr(r.incr_decr()?),
        MessageKind::Decr => Message::Decr(r.incr_decr()?),
        MessageKind::Append => Message::Append(r.append_prepend()?),
        MessageKind::Prepend => Message::Prepend(r.append_prepend()?),
        MessageKind::Delete => Message::Delete(r.delete()?),
        MessageKind::BackfillDelete => Message::BackfillDelete(r.delete()?),
        MessageKind::BackfillDeleteRange => {
            let hash_value = r.u32()?;
            let hashmod = r.u32()?;
            if hashmod == 0 {
                return Err(ProtocolError::InvalidField {
                    field: "hashmod",
                    value: 0,
                });
            }
            if hash_value >= hashmod {
                return Err(ProtocolError::InvalidField {
                    field: "hash_value",
                    value: u64::from(hash_value),
                });
            }
            Message::BackfillDeleteRange(BackfillRange {
                hash_value,
                hashmod,
                low_key: r.bound()?,
                high_key: r.bound()?,
            })
        }
    };

    Ok(msg)
}

fn put_timestamp(buf: &mut BytesMut, ts: ReplTimestamp) {
    buf.put_u32_le(ts.get());
}

fn put_key(buf: &mut BytesMut, key: &StoreKey) {
    // StoreKey guarantees len <= MAX_KEY_SIZE < INFINITY_KEY_SIZE
    buf.put_u8(key.len() as u8);
    buf.put_slice(key.as_bytes());
}

fn put_bound(buf: &mut BytesMut, bound: &KeyBound) {
    match bound {
        KeyBound::Unbounded => buf.put_u8(INFINITY_KEY_SIZE),
        KeyBound::Key(key) => put_key(buf, key),
    }
}

/// Wire length prefix of a value of `len` bytes
fn value_len_prefix(len: usize) -> ProtocolResult<u32> {
    u32::try_from(len).map_err(|_| ProtocolError::InvalidField {
        field: "value_size",
        value: len as u64,
    })
}

fn put_value(buf: &mut BytesMut, value: &Bytes) -> ProtocolResult<()> {
    buf.put_u32_le(value_len_prefix(value.len())?);
    buf.put_slice(value);
    Ok(())
}

fn add_policy_byte(policy: AddPolicy) -> u8 {
    match policy {
        AddPolicy::Yes => 0,
        AddPolicy::No => 1,
    }
}

fn replace_policy_byte(policy: ReplacePolicy) -> u8 {
    match policy {
        ReplacePolicy::Yes => 0,
        ReplacePolicy::No => 1,
        ReplacePolicy::IfCasMatches => 2,
    }
}

/// Bounds-checked field reader
struct Reader<'a, B> {
    buf: &'a mut B,
}

impl<B: Buf> Reader<'_, B> {
    fn need(&self, needed: usize) -> ProtocolResult<()> {
        let available = self.buf.remaining();
        if available < needed {
            return Err(ProtocolError::Truncated { needed, available });
        }
        Ok(())
    }

    fn u8(&mut self) -> ProtocolResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self) -> ProtocolResult<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self) -> ProtocolResult<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn timestamp(&mut self) -> ProtocolResult<ReplTimestamp> {
        self.u32().map(ReplTimestamp::new)
    }

    fn bytes(&mut self, len: usize) -> ProtocolResult<Bytes> {
        self.need(len)?;
        Ok(self.buf.copy_to_bytes(len))
    }

    fn key_of_len(&mut self, len: u8) -> ProtocolResult<StoreKey> {
        if usize::from(len) > MAX_KEY_SIZE {
            return Err(ProtocolError::InvalidField {
                field: "key_size",
                value: u64::from(len),
            });
        }
        let bytes = self.bytes(usize::from(len))?;
        StoreKey::new(bytes.to_vec()).map_err(|e| ProtocolError::InvalidField {
            field: "key_size",
            value: e.0 as u64,
        })
    }

    fn key(&mut self) -> ProtocolResult<StoreKey> {
        let len = self.u8()?;
        self.key_of_len(len)
    }

    fn bound(&mut self) -> ProtocolResult<KeyBound> {
        match self.u8()? {
            INFINITY_KEY_SIZE => Ok(KeyBound::Unbounded),
            len => self.key_of_len(len).map(KeyBound::Key),
        }
    }

    fn value(&mut self) -> ProtocolResult<Bytes> {
        let len = self.u32()? as usize;
        self.bytes(len)
    }

    fn add_policy(&mut self) -> ProtocolResult<AddPolicy> {
        match self.u8()? {
            0 => Ok(AddPolicy::Yes),
            1 => Ok(AddPolicy::No),
            other => Err(ProtocolError::InvalidField {
                field: "add_policy",
                value: u64::from(other),
            }),
        }
    }

    fn replace_policy(&mut self) -> ProtocolResult<ReplacePolicy> {
        match self.u8()? {
            0 => Ok(ReplacePolicy::Yes),
            1 => Ok(ReplacePolicy::No),
            2 => Ok(ReplacePolicy::IfCasMatches),
            other => Err(ProtocolError::InvalidField {
                field: "replace_policy",
                value: u64::from(other),
            }),
        }
    }

    fn incr_decr(&mut self) -> ProtocolResult<IncrDecr> {
        Ok(IncrDecr {
            timestamp: self.timestamp()?,
            proposed_cas: self.u64()?,
            amount: self.u64()?,
            key: self.key()?,
        })
    }

    fn append_prepend(&mut self) -> ProtocolResult<AppendPrepend> {
        Ok(AppendPrepend {
            timestamp: self.timestamp()?,
            proposed_cas: self.u64()?,
            key: self.key()?,
            data: self.value()?,
        })
    }

    fn delete(&mut self) -> ProtocolResult<Delete> {
        Ok(Delete {
            timestamp: self.timestamp()?,
            key: self.key()?,
        })
    }
}
