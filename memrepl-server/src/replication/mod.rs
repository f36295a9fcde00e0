/// Replication module - master/slave replication of the key-value store
///
/// - 1 Master node (accepts writes)
/// - N Slave nodes (read-only, follow the master)
/// - Async replication over a binary, length-framed protocol
///
/// Features:
/// - Versioned handshake with database identity checks
/// - Full or partial backfill on (re)connect, bounded by a time barrier
/// - Live mutation stream with CAS values proposed by the master
/// - Heartbeats and dead-peer detection
pub mod apply;
pub mod backfill;
pub mod clock;
pub mod codec;
pub mod config;
pub mod format;
pub mod frame;
pub mod heartbeat;
pub mod master;
pub mod message;
pub mod replica;
pub mod session;
pub mod storage;
mod transport;
pub mod types;

pub use apply::{ApplyOutcome, ConditionFailure, apply_live};
pub use backfill::{BackfillConsumer, BackfillProducer, BackfillReport};
pub use codec::{ProtocolError, decode, encode};
pub use config::ReplicationConfig;
pub use format::format_message;
pub use frame::{FrameReader, FrameWriter};
pub use master::{MasterNode, SetRequest};
pub use message::{Message, MessageKind, ReplTimestamp, StoreKey};
pub use replica::ReplicaNode;
pub use session::{ReplicationSession, SessionPhase, SessionRole};
pub use storage::StorageEngine;
pub use types::{
    NodeRole, ReplicaInfo, ReplicationError, ReplicationResult, ReplicationStats,
};
