//! Replication session state machine
//!
//! The session never touches a socket or the storage engine. The driver in
//! [`super::master`] or [`super::replica`] feeds it every inbound message and
//! carries out the returned [`SessionAction`]s in order. A session therefore
//! has exactly one writer: the task driving its connection.

use super::message::{Message, MessageKind, ReplTimestamp};
use super::types::{ReplicationError, ReplicationResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Serves backfill and streams live mutations
    Master,
    /// Requests backfill and applies what it receives
    Slave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Connecting,
    HelloExchanged,
    Introduced,
    Backfilling,
    Streaming,
    Failed,
    Closed,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Failed | SessionPhase::Closed)
    }
}

/// What this node says about itself during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalIdentity {
    pub protocol_version: u32,
    pub database_creation_timestamp: u32,
    pub node_id: u32,
}

/// Identity announced by the remote side in its Introduce message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub node_id: u32,
    pub database_creation_timestamp: u32,
}

/// Database creation timestamps of every peer seen so far, by node id
///
/// Shared by all sessions of a node and kept across reconnects.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    known: Arc<RwLock<HashMap<u32, u32>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer_node_id: u32) -> Option<u32> {
        self.known.read().get(&peer_node_id).copied()
    }

    /// Record `peer`, failing if it was previously seen with another database
    pub fn verify(&self, peer: PeerIdentity) -> ReplicationResult<()> {
        let mut known = self.known.write();
        match known.get(&peer.node_id) {
            Some(&expected) if expected != peer.database_creation_timestamp => {
                Err(ReplicationError::IdentityMismatch {
                    peer_node_id: peer.node_id,
                    expected,
                    actual: peer.database_creation_timestamp,
                })
            }
            Some(_) => Ok(()),
            None => {
                known.insert(peer.node_id, peer.database_creation_timestamp);
                Ok(())
            }
        }
    }

    /// Record `peer` unconditionally, returning the identity it replaces
    pub fn record(&self, peer: PeerIdentity) -> Option<u32> {
        self.known
            .write()
            .insert(peer.node_id, peer.database_creation_timestamp)
            .filter(|&previous| previous != peer.database_creation_timestamp)
    }
}

/// Work the driver must perform after feeding a message to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Write a message to the peer
    Send(Message),
    /// Master: stream backfill from `since`, then call [`ReplicationSession::backfill_sent`]
    StartBackfill { since: ReplTimestamp },
    /// Slave: apply one entry of the backfill stream
    ApplyBackfill(Message),
    /// Slave: hold a live message until the time barrier is known
    BufferLive(Message),
    /// Slave: backfill finished at this barrier; replay what was buffered
    CompleteBackfill { time_barrier: ReplTimestamp },
    /// Slave: apply a live mutation or time barrier
    ApplyLive(Message),
}

#[derive(Debug)]
pub struct ReplicationSession {
    role: SessionRole,
    phase: SessionPhase,
    local: LocalIdentity,
    registry: PeerRegistry,
    peer: Option<PeerIdentity>,
    negotiated_version: Option<u32>,
    /// Slave: barrier everything up to which has been applied
    last_applied: ReplTimestamp,
    hello_sent: bool,
    failure: Option<&'static str>,
}

impl ReplicationSession {
    pub fn new(role: SessionRole, local: LocalIdentity, registry: PeerRegistry) -> Self {
        Self {
            role,
            phase: SessionPhase::Connecting,
            local,
            registry,
            peer: None,
            negotiated_version: None,
            last_applied: ReplTimestamp::DISTANT_PAST,
            hello_sent: false,
            failure: None,
        }
    }

    /// Slave: ask for backfill since `last_applied` instead of a full reset
    pub fn resume_from(mut self, last_applied: ReplTimestamp) -> Self {
        self.last_applied = last_applied;
        self
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn peer(&self) -> Option<PeerIdentity> {
        self.peer
    }

    pub fn negotiated_version(&self) -> Option<u32> {
        self.negotiated_version
    }

    pub fn last_applied(&self) -> ReplTimestamp {
        self.last_applied
    }

    /// Reason code of the error that failed this session
    pub fn failure(&self) -> Option<&'static str> {
        self.failure
    }

    /// First message of every session, sent by both sides
    pub fn begin(&mut self) -> Message {
        self.hello_sent = true;
        Message::Hello {
            protocol_version: self.local.protocol_version,
        }
    }

    /// Feed one inbound message
    ///
    /// A returned error is fatal: the session is already `Failed` and the
    /// driver must close the transport.
    pub fn handle_message(&mut self, msg: Message) -> ReplicationResult<Vec<SessionAction>> {
        let result = self.dispatch(msg);
        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }

    /// Master: the whole backfill stream, `BackfillComplete` included, was written
    pub fn backfill_sent(&mut self, time_barrier: ReplTimestamp) {
        if self.role == SessionRole::Master && self.phase == SessionPhase::Backfilling {
            self.last_applied = time_barrier;
            self.phase = SessionPhase::Streaming;
        }
    }

    /// Record a fatal error and move to `Failed`
    pub fn fail(&mut self, error: &ReplicationError) {
        if self.phase == SessionPhase::Closed {
            return;
        }
        self.failure = Some(error.reason_code());
        self.phase = SessionPhase::Failed;
    }

    /// Transport released; every session ends `Closed`
    ///
    /// A failed session keeps its reason in [`failure`](Self::failure).
    pub fn close(&mut self) {
        self.phase = SessionPhase::Closed;
    }

    fn dispatch(&mut self, msg: Message) -> ReplicationResult<Vec<SessionAction>> {
        use SessionPhase::*;

        if self.phase.is_terminal() {
            return Err(self.unexpected(msg.kind()));
        }

        match (self.role, self.phase, msg) {
            (_, _, Message::Heartbeat) => Ok(Vec::new()),

            (_, Connecting, Message::Hello { protocol_version }) => {
                self.on_hello(protocol_version)
            }

            (
                _,
                HelloExchanged,
                Message::Introduce {
                    database_creation_timestamp,
                    peer_node_id,
                },
            ) => self.on_introduce(PeerIdentity {
                node_id: peer_node_id,
                database_creation_timestamp,
            }),

            (SessionRole::Master, Introduced, Message::Backfill { since }) => {
                self.phase = Backfilling;
                Ok(vec![SessionAction::StartBackfill { since }])
            }

            (SessionRole::Slave, Backfilling, Message::BackfillComplete { time_barrier }) => {
                self.last_applied = time_barrier;
                self.phase = Streaming;
                Ok(vec![SessionAction::CompleteBackfill { time_barrier }])
            }

            (SessionRole::Slave, Backfilling, msg) if msg.is_backfill_entry() => {
                Ok(vec![SessionAction::ApplyBackfill(msg)])
            }

            (SessionRole::Slave, Backfilling, msg) if msg.is_live() => {
                Ok(vec![SessionAction::BufferLive(msg)])
            }

            (SessionRole::Slave, Streaming, msg) if msg.is_live() => {
                if let Message::TimeBarrier { timestamp } = msg {
                    self.last_applied = self.last_applied.max(timestamp);
                }
                Ok(vec![SessionAction::ApplyLive(msg)])
            }

            (_, _, msg) => Err(self.unexpected(msg.kind())),
        }
    }

    fn on_hello(&mut self, remote: u32) -> ReplicationResult<Vec<SessionAction>> {
        if remote != self.local.protocol_version {
            return Err(ReplicationError::VersionMismatch {
                local: self.local.protocol_version,
                remote,
            });
        }

        self.negotiated_version = Some(remote);
        self.phase = SessionPhase::HelloExchanged;

        let mut actions = Vec::with_capacity(2);
        if !self.hello_sent {
            actions.push(SessionAction::Send(self.begin()));
        }
        actions.push(SessionAction::Send(Message::Introduce {
            database_creation_timestamp: self.local.database_creation_timestamp,
            peer_node_id: self.local.node_id,
        }));
        Ok(actions)
    }

    fn on_introduce(&mut self, peer: PeerIdentity) -> ReplicationResult<Vec<SessionAction>> {
        match self.role {
            // A slave must never follow a master whose database was reset
            SessionRole::Slave => self.registry.verify(peer)?,
            SessionRole::Master => {
                if let Some(previous) = self.registry.record(peer) {
                    warn!(
                        "Slave {} reconnected with a new database (was created at {}, now {})",
                        peer.node_id, previous, peer.database_creation_timestamp
                    );
                }
            }
        }

        info!(
            "Peer {} introduced (database created at {})",
            peer.node_id, peer.database_creation_timestamp
        );
        self.peer = Some(peer);
        self.phase = SessionPhase::Introduced;

        match self.role {
            SessionRole::Slave => {
                self.phase = SessionPhase::Backfilling;
                Ok(vec![SessionAction::Send(Message::Backfill {
                    since: self.last_applied,
                })])
            }
            SessionRole::Master => Ok(Vec::new()),
        }
    }

    fn unexpected(&self, kind: MessageKind) -> ReplicationError {
        ReplicationError::UnexpectedMessage {
            kind,
            phase: self.phase,
        }
    }
}
