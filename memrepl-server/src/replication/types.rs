use super::codec::ProtocolError;
use super::message::MessageKind;
use super::session::SessionPhase;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Version of the replication wire protocol spoken by this build
pub const REPLICATION_PROTOCOL_VERSION: u32 = 1;

/// Node role in replication topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Master node - accepts writes, streams them to slaves
    Master,
    /// Replica (slave) node - read-only, follows a master
    Replica,
    /// Standalone node - no replication
    #[default]
    Standalone,
}

/// Replication statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationStats {
    /// Current master clock (master) or last known barrier (replica)
    pub master_timestamp: u32,
    /// Last timestamp the replica is known to have fully applied
    pub last_applied: u32,
    /// Live mutations replicated (master) or applied (replica)
    pub total_replicated: u64,
    /// Backfill entries sent (master) or applied (replica)
    pub backfill_entries: u64,
    /// Mutations whose condition failed when applied on the replica
    pub condition_failures: u64,
    /// Total bytes sent (master) or received (replica)
    pub total_bytes: u64,
    /// Unix seconds of the last inbound traffic
    pub last_heartbeat: u64,
    /// Sessions that ended with a fatal error
    pub failed_sessions: u64,
    /// Connection status
    pub connected: bool,
}

/// Replica info, as seen by the master
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub session_id: u64,
    pub node_id: Option<u32>,
    pub address: Option<SocketAddr>,
    pub phase: SessionPhase,
    pub connected_at: u64,
    pub last_heartbeat: u64,
    pub backfill_since: Option<u32>,
}

/// Session-fatal replication errors
///
/// Operation-level condition failures are not errors; see
/// [`crate::replication::apply::ApplyOutcome`].
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("Not a master node")]
    NotMaster,

    #[error("Not a replica node")]
    NotReplica,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error(
        "Peer {peer_node_id} identity mismatch: known database created at {expected}, peer reports {actual}"
    )]
    IdentityMismatch {
        peer_node_id: u32,
        expected: u32,
        actual: u32,
    },

    #[error("No traffic from peer within {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("Unexpected {kind} message in phase {phase:?}")]
    UnexpectedMessage {
        kind: MessageKind,
        phase: SessionPhase,
    },

    #[error("Backfill buffer overflow: more than {0} live messages before the time barrier")]
    BackfillBufferOverflow(usize),

    #[error("Value too large to replicate: frame of {got_bytes} bytes exceeds max {max_frame_bytes}")]
    ValueTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },

    /// The local node stopped while a write was in flight; ends the session `Closed`
    #[error("Node is shutting down")]
    ShuttingDown,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ReplicationError {
    /// Short stable identifier surfaced to operational logging
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::NotMaster => "not_master",
            Self::NotReplica => "not_replica",
            Self::Protocol(e) => e.reason_code(),
            Self::VersionMismatch { .. } => "version_mismatch",
            Self::IdentityMismatch { .. } => "identity_mismatch",
            Self::HeartbeatTimeout(_) => "heartbeat_timeout",
            Self::UnexpectedMessage { .. } => "unexpected_message",
            Self::BackfillBufferOverflow(_) => "backfill_buffer_overflow",
            Self::ValueTooLarge { .. } => "value_too_large",
            Self::ShuttingDown => "shutdown",
            Self::ConnectionFailed(_) => "connection_failed",
            Self::Storage(_) => "storage",
            Self::IOError(_) => "io",
            Self::InvalidConfig(_) => "invalid_config",
        }
    }
}

impl From<crate::core::StoreError> for ReplicationError {
    fn from(e: crate::core::StoreError) -> Self {
        ReplicationError::Storage(e.to_string())
    }
}

pub type ReplicationResult<T> = std::result::Result<T, ReplicationError>;

pub(crate) fn unix_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
