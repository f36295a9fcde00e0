use super::apply::{ApplyOutcome, apply_live};
use super::backfill::BackfillConsumer;
use super::config::ReplicationConfig;
use super::message::{Message, ReplTimestamp};
use super::session::{
    LocalIdentity, PeerRegistry, ReplicationSession, SessionAction, SessionPhase, SessionRole,
};
use super::storage::StorageEngine;
use super::transport::{SessionEvent, SessionIo};
use super::types::{
    REPLICATION_PROTOCOL_VERSION, ReplicationError, ReplicationResult, ReplicationStats,
    unix_now_secs,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Replica Node - Read-only node that follows a master
///
/// Features:
/// - Connects to the master on startup
/// - Receives full or partial backfill, then the live stream
/// - Applies mutations to local storage
/// - Auto-reconnects on disconnect, resuming from the last time barrier
pub struct ReplicaNode<S: StorageEngine> {
    config: ReplicationConfig,
    storage: Arc<S>,
    identity: LocalIdentity,

    /// Master identities seen so far, kept across reconnects
    registry: PeerRegistry,

    /// Newest time barrier everything before which has been applied
    last_applied: AtomicU32,

    /// Phase of the current (or last) session
    phase: RwLock<SessionPhase>,

    /// Reason code of the last session that failed
    last_failure: RwLock<Option<&'static str>>,

    /// Connection status
    connected: AtomicBool,

    /// Replication stats
    stats: RwLock<ReplicationStats>,

    shutdown: watch::Sender<bool>,
}

impl<S: StorageEngine> ReplicaNode<S> {
    /// Create a replica node and start following `master_address`
    pub async fn new(config: ReplicationConfig, storage: Arc<S>) -> ReplicationResult<Arc<Self>> {
        let replica = Self::detached(config, storage)?;

        let replica_clone = Arc::clone(&replica);
        tokio::spawn(async move {
            replica_clone.replication_loop().await;
        });

        Ok(replica)
    }

    /// Create a replica node without connecting anywhere; sessions are run
    /// with [`run_session`](Self::run_session)
    pub fn detached(config: ReplicationConfig, storage: Arc<S>) -> ReplicationResult<Arc<Self>> {
        if !config.is_replica() {
            return Err(ReplicationError::NotReplica);
        }
        config.validate().map_err(ReplicationError::InvalidConfig)?;

        info!("Initializing replica node {}", config.node_id);

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            identity: LocalIdentity {
                protocol_version: REPLICATION_PROTOCOL_VERSION,
                database_creation_timestamp: storage.creation_timestamp(),
                node_id: config.node_id,
            },
            registry: PeerRegistry::new(),
            last_applied: AtomicU32::new(ReplTimestamp::DISTANT_PAST.get()),
            phase: RwLock::new(SessionPhase::Closed),
            last_failure: RwLock::new(None),
            connected: AtomicBool::new(false),
            stats: RwLock::new(ReplicationStats::default()),
            shutdown,
            config,
            storage,
        }))
    }

    /// Main replication loop - connect, run a session, reconnect
    async fn replication_loop(self: Arc<Self>) {
        let Some(master_addr) = self.config.master_address else {
            error!("Replica has no master_address; not replicating");
            return;
        };
        let reconnect_delay = self.config.reconnect_delay();
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }

            info!("Connecting to master at {}", master_addr);
            match TcpStream::connect(master_addr).await {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY: {}", e);
                    }
                    info!("Connected to master");
                    match self.run_session(stream).await {
                        Ok(()) => info!("Replication session closed"),
                        Err(e) => error!(
                            reason = e.reason_code(),
                            "Replication session failed: {}", e
                        ),
                    }
                }
                Err(e) => {
                    let e = ReplicationError::ConnectionFailed(e.to_string());
                    warn!(reason = e.reason_code(), "{}", e);
                }
            }

            if !self.config.auto_reconnect {
                warn!("Auto-reconnect disabled, stopping replication");
                break;
            }
            if *shutdown.borrow() {
                break;
            }

            info!("Reconnecting in {:?}", reconnect_delay);
            tokio::select! {
                _ = tokio::time::sleep(reconnect_delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("Replication loop stopped");
    }

    /// Run one slave session over `transport` until it closes or fails
    pub async fn run_session<T>(&self, transport: T) -> ReplicationResult<()>
    where
        T: AsyncRead + AsyncWrite + Send,
    {
        let mut io = SessionIo::new(transport, &self.config, self.shutdown.subscribe());
        let mut session =
            ReplicationSession::new(SessionRole::Slave, self.identity, self.registry.clone())
                .resume_from(self.last_applied());
        let mut consumer = BackfillConsumer::new(self.config.backfill_buffer_limit);

        self.set_phase(session.phase());
        self.connected.store(true, Ordering::SeqCst);
        self.stats.write().connected = true;

        let result = match self.drive(&mut io, &mut session, &mut consumer).await {
            Err(ReplicationError::ShuttingDown) => Ok(()),
            other => other,
        };

        if let Err(e) = &result {
            session.fail(e);
            self.set_phase(session.phase());
            *self.last_failure.write() = session.failure();
        }
        let dropped = consumer.abort();
        if dropped > 0 {
            debug!("Released {} buffered live messages", dropped);
        }
        io.close().await;
        session.close();

        self.set_phase(session.phase());
        self.connected.store(false, Ordering::SeqCst);
        {
            let mut stats = self.stats.write();
            stats.connected = false;
            if result.is_err() {
                stats.failed_sessions += 1;
            }
        }
        result
    }

    async fn drive<T: AsyncRead + AsyncWrite>(
        &self,
        io: &mut SessionIo<T>,
        session: &mut ReplicationSession,
        consumer: &mut BackfillConsumer,
    ) -> ReplicationResult<()> {
        if io.is_shutting_down() {
            return Ok(());
        }

        let hello = session.begin();
        io.send(&hello).await?;

        loop {
            let msg = match io.next_event(&mut None).await? {
                SessionEvent::Inbound(msg) => msg,
                SessionEvent::PeerClosed => {
                    info!("Master closed the replication stream");
                    return Ok(());
                }
                SessionEvent::Shutdown => return Ok(()),
                SessionEvent::Live(_) => continue,
            };

            {
                let mut stats = self.stats.write();
                stats.total_bytes = io.bytes_read();
                stats.last_heartbeat = unix_now_secs();
            }

            for action in session.handle_message(msg)? {
                self.perform(action, io, consumer).await?;
            }
            self.set_phase(session.phase());
        }
    }

    async fn perform<T: AsyncRead + AsyncWrite>(
        &self,
        action: SessionAction,
        io: &mut SessionIo<T>,
        consumer: &mut BackfillConsumer,
    ) -> ReplicationResult<()> {
        match action {
            SessionAction::Send(msg) => io.send(&msg).await?,
            SessionAction::ApplyBackfill(msg) => {
                consumer.apply_entry(&*self.storage, &msg).await?;
                self.stats.write().backfill_entries += 1;
            }
            SessionAction::BufferLive(msg) => consumer.buffer_live(msg)?,
            SessionAction::CompleteBackfill { time_barrier } => {
                let report = consumer.complete(&*self.storage, time_barrier).await?;
                self.advance_last_applied(report.last_barrier);
                let mut stats = self.stats.write();
                stats.total_replicated += report.replayed;
                stats.condition_failures += report.condition_failures;
            }
            SessionAction::ApplyLive(msg) => {
                let outcome = apply_live(&*self.storage, &msg).await?;
                match (&msg, outcome) {
                    (Message::TimeBarrier { timestamp }, _) => {
                        self.advance_last_applied(*timestamp);
                    }
                    (_, ApplyOutcome::Applied) => {
                        self.stats.write().total_replicated += 1;
                    }
                    (_, ApplyOutcome::ConditionFailed(reason)) => {
                        debug!("Replicated {} not applied: {}", msg.kind(), reason);
                        self.stats.write().condition_failures += 1;
                    }
                }
            }
            SessionAction::StartBackfill { .. } => {
                warn!("Ignoring master-side backfill request on replica");
            }
        }
        Ok(())
    }

    fn advance_last_applied(&self, timestamp: ReplTimestamp) {
        self.last_applied
            .fetch_max(timestamp.get(), Ordering::SeqCst);
    }

    fn set_phase(&self, phase: SessionPhase) {
        *self.phase.write() = phase;
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Newest time barrier known to be fully applied
    pub fn last_applied(&self) -> ReplTimestamp {
        ReplTimestamp::new(self.last_applied.load(Ordering::SeqCst))
    }

    /// Phase of the current session, or of the last one if disconnected
    pub fn phase(&self) -> SessionPhase {
        *self.phase.read()
    }

    /// Reason code of the most recent failed session, if any
    pub fn last_failure(&self) -> Option<&'static str> {
        *self.last_failure.read()
    }

    /// Check if connected to master
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Get replication statistics
    pub fn stats(&self) -> ReplicationStats {
        let mut stats = self.stats.read().clone();
        stats.last_applied = self.last_applied().get();
        stats.master_timestamp = stats.last_applied;
        stats.connected = self.is_connected();
        stats
    }

    /// Close the current session and stop reconnecting
    pub fn shutdown(&self) {
        info!("Shutting down replica node");
        self.shutdown.send_replace(true);
    }
}
