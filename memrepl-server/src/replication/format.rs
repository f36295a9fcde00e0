//! Human-readable rendering of replication messages for logs

use super::message::{AddPolicy, BackfillRange, KeyBound, Message, ReplacePolicy, StoreKey};
use std::fmt::{self, Write};

/// Payloads up to this size are shown in full
const PREVIEW_FULL_LIMIT: usize = 32;
/// Bytes shown from each end of a longer payload
const PREVIEW_EDGE: usize = 16;

/// Render `msg` as `KIND field=value ... key="..." value="..."`
pub fn format_message(msg: &Message) -> String {
    msg.to_string()
}

/// Escaped preview of a byte payload, eliding the middle of long values
pub fn preview_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(PREVIEW_FULL_LIMIT * 2 + 16);
    out.push('"');
    if bytes.len() <= PREVIEW_FULL_LIMIT {
        escape_into(&mut out, bytes);
        out.push('"');
    } else {
        escape_into(&mut out, &bytes[..PREVIEW_EDGE]);
        out.push_str("...");
        escape_into(&mut out, &bytes[bytes.len() - PREVIEW_EDGE..]);
        let _ = write!(out, "\" ({} bytes)", bytes.len());
    }
    out
}

fn escape_into(out: &mut String, bytes: &[u8]) {
    for &b in bytes {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(b as char),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            _ => {
                let _ = write!(out, "\\x{:02x}", b);
            }
        }
    }
}

fn key_preview(key: &StoreKey) -> String {
    preview_bytes(key.as_bytes())
}

fn bound_preview(bound: &KeyBound) -> String {
    match bound {
        KeyBound::Unbounded => "inf".to_string(),
        KeyBound::Key(key) => key_preview(key),
    }
}

fn add_policy_name(policy: AddPolicy) -> &'static str {
    match policy {
        AddPolicy::Yes => "yes",
        AddPolicy::No => "no",
    }
}

fn replace_policy_name(policy: ReplacePolicy) -> &'static str {
    match policy {
        ReplacePolicy::Yes => "yes",
        ReplacePolicy::No => "no",
        ReplacePolicy::IfCasMatches => "if_cas_matches",
    }
}

fn fmt_range(f: &mut fmt::Formatter<'_>, range: &BackfillRange) -> fmt::Result {
    write!(
        f,
        " hash_value={} hashmod={} low={} high={}",
        range.hash_value,
        range.hashmod,
        bound_preview(&range.low_key),
        bound_preview(&range.high_key)
    )
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind().name())?;
        match self {
            Message::Hello { protocol_version } => {
                write!(f, " protocol_version={}", protocol_version)
            }
            Message::Introduce {
                database_creation_timestamp,
                peer_node_id,
            } => write!(
                f,
                " database_creation_timestamp={} peer_node_id={}",
                database_creation_timestamp, peer_node_id
            ),
            Message::Backfill { since } => write!(f, " since={}", since),
            Message::BackfillComplete { time_barrier } => {
                write!(f, " time_barrier={}", time_barrier)
            }
            Message::TimeBarrier { timestamp } => write!(f, " timestamp={}", timestamp),
            Message::Heartbeat => Ok(()),
            Message::GetCas(m) => write!(
                f,
                " timestamp={} proposed_cas={} key={}",
                m.timestamp,
                m.proposed_cas,
                key_preview(&m.key)
            ),
            Message::Sarc(m) => {
                write!(
                    f,
                    " timestamp={} proposed_cas={} flags={} exptime={} add={} replace={}",
                    m.timestamp,
                    m.proposed_cas,
                    m.flags,
                    m.exptime,
                    add_policy_name(m.add_policy),
                    replace_policy_name(m.replace_policy)
                )?;
                if m.replace_policy == ReplacePolicy::IfCasMatches {
                    write!(f, " old_cas={}", m.old_cas)?;
                }
                write!(
                    f,
                    " key={} value={}",
                    key_preview(&m.key),
                    preview_bytes(&m.value)
                )
            }
            Message::BackfillSet(m) => write!(
                f,
                " timestamp={} flags={} exptime={} cas={} key={} value={}",
                m.timestamp,
                m.flags,
                m.exptime,
                m.cas_or_zero,
                key_preview(&m.key),
                preview_bytes(&m.value)
            ),
            Message::Incr(m) | Message::Decr(m) => write!(
                f,
                " timestamp={} proposed_cas={} amount={} key={}",
                m.timestamp,
                m.proposed_cas,
                m.amount,
                key_preview(&m.key)
            ),
            Message::Append(m) | Message::Prepend(m) => write!(
                f,
                " timestamp={} proposed_cas={} key={} value={}",
                m.timestamp,
                m.proposed_cas,
                key_preview(&m.key),
                preview_bytes(&m.data)
            ),
            Message::Delete(m) | Message::BackfillDelete(m) => {
                write!(f, " timestamp={} key={}", m.timestamp, key_preview(&m.key))
            }
            Message::BackfillDeleteRange(range) => fmt_range(f, range),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::message::{Delete, ReplTimestamp, Sarc};
    use bytes::Bytes;

    #[test]
    fn test_short_payload_shown_in_full() {
        assert_eq!(preview_bytes(b"hello"), "\"hello\"");
        assert_eq!(preview_bytes(b"a\0\"b"), "\"a\\x00\\\"b\"");
        assert_eq!(preview_bytes(&[b'x'; 32]), format!("\"{}\"", "x".repeat(32)));
    }

    #[test]
    fn test_long_payload_elided() {
        let mut value = vec![b'h'; 16];
        value.extend_from_slice(&[b'm'; 100]);
        value.extend_from_slice(&[b't'; 16]);

        assert_eq!(
            preview_bytes(&value),
            format!("\"{}...{}\" (132 bytes)", "h".repeat(16), "t".repeat(16))
        );
    }

    #[test]
    fn test_format_sarc() {
        let msg = Message::Sarc(Sarc {
            timestamp: ReplTimestamp::new(3),
            proposed_cas: 42,
            flags: 1,
            exptime: 0,
            add_policy: AddPolicy::No,
            replace_policy: ReplacePolicy::IfCasMatches,
            old_cas: 41,
            key: StoreKey::try_from("user:1").unwrap(),
            value: Bytes::from_static(b"v"),
        });

        assert_eq!(
            format_message(&msg),
            "SARC timestamp=t3 proposed_cas=42 flags=1 exptime=0 add=no replace=if_cas_matches old_cas=41 key=\"user:1\" value=\"v\""
        );
    }

    #[test]
    fn test_format_control_messages() {
        assert_eq!(format_message(&Message::Heartbeat), "HEARTBEAT");
        assert_eq!(
            Message::BackfillDeleteRange(BackfillRange::unbounded(0, 1)).to_string(),
            "BACKFILL_DELETE_RANGE hash_value=0 hashmod=1 low=inf high=inf"
        );
        assert_eq!(
            Message::BackfillDelete(Delete {
                timestamp: ReplTimestamp::new(7),
                key: StoreKey::try_from("k").unwrap(),
            })
            .to_string(),
            "BACKFILL_DELETE timestamp=t7 key=\"k\""
        );
    }
}
