use super::backfill::BackfillProducer;
use super::clock::{CasGenerator, ReplicationClock};
use super::codec;
use super::config::ReplicationConfig;
use super::message::{
    AddPolicy, AppendPrepend, Cas, Delete, GetCas, IncrDecr, Message, ReplTimestamp,
    ReplacePolicy, Sarc, StoreKey,
};
use super::session::{
    LocalIdentity, PeerRegistry, ReplicationSession, SessionAction, SessionPhase, SessionRole,
};
use super::storage::{
    AppendPrependOutcome, DeleteOutcome, IncrDecrOutcome, SetOutcome, StorageEngine, StoredItem,
};
use super::transport::{SessionEvent, SessionIo};
use super::types::{
    REPLICATION_PROTOCOL_VERSION, ReplicaInfo, ReplicationError, ReplicationResult,
    ReplicationStats, unix_now_secs,
};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, info, warn};

/// Conditional store request, covering set, add, replace and cas
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetRequest {
    pub key: StoreKey,
    pub value: Bytes,
    pub flags: u32,
    /// Absolute unix seconds, 0 = never
    pub exptime: u32,
    pub add_policy: AddPolicy,
    pub replace_policy: ReplacePolicy,
    pub old_cas: Cas,
}

impl SetRequest {
    /// Store unconditionally
    pub fn set(key: StoreKey, value: impl Into<Bytes>) -> Self {
        Self {
            key,
            value: value.into(),
            flags: 0,
            exptime: 0,
            add_policy: AddPolicy::Yes,
            replace_policy: ReplacePolicy::Yes,
            old_cas: 0,
        }
    }

    /// Store only if the key is absent
    pub fn add(key: StoreKey, value: impl Into<Bytes>) -> Self {
        Self {
            replace_policy: ReplacePolicy::No,
            ..Self::set(key, value)
        }
    }

    /// Store only if the key is present
    pub fn replace(key: StoreKey, value: impl Into<Bytes>) -> Self {
        Self {
            add_policy: AddPolicy::No,
            ..Self::set(key, value)
        }
    }

    /// Store only if the current CAS is `old_cas`
    pub fn cas(key: StoreKey, value: impl Into<Bytes>, old_cas: Cas) -> Self {
        Self {
            add_policy: AddPolicy::No,
            replace_policy: ReplacePolicy::IfCasMatches,
            old_cas,
            ..Self::set(key, value)
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_exptime(mut self, exptime: u32) -> Self {
        self.exptime = exptime;
        self
    }
}

/// Master Node - Accepts writes and replicates them to slaves
///
/// Features:
/// - Applies writes to local storage and streams them to every slave
/// - Serves full and partial backfill to (re)joining slaves
/// - Emits periodic time barriers and heartbeats
pub struct MasterNode<S: StorageEngine> {
    shared: Arc<MasterShared<S>>,
    local_addr: Option<SocketAddr>,
}

struct MasterShared<S> {
    config: ReplicationConfig,
    storage: Arc<S>,
    identity: LocalIdentity,
    registry: PeerRegistry,
    clock: ReplicationClock,
    cas: CasGenerator,

    /// Serializes local apply, broadcast and backfill snapshots
    write_gate: Mutex<()>,

    /// Connected slaves by session id
    replicas: RwLock<HashMap<u64, ReplicaConnection>>,
    next_session_id: AtomicU64,
    stats: RwLock<ReplicationStats>,
    shutdown: watch::Sender<bool>,
}

struct ReplicaConnection {
    info: ReplicaInfo,
    /// Present once the slave asked for backfill
    sender: Option<mpsc::UnboundedSender<Message>>,
}

impl<S: StorageEngine> MasterNode<S> {
    /// Create a master node listening for slaves on `replica_listen_address`
    pub async fn new(config: ReplicationConfig, storage: Arc<S>) -> ReplicationResult<Self> {
        let listen_addr = config
            .replica_listen_address
            .ok_or_else(|| ReplicationError::InvalidConfig("missing replica_listen_address".into()))?;
        let mut master = Self::detached(config, storage)?;

        let listener = TcpListener::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Master listening for replicas on {}", local_addr);

        let shutdown = master.shared.shutdown.subscribe();
        tokio::spawn(Arc::clone(&master.shared).listen_for_replicas(listener, shutdown));
        master.local_addr = Some(local_addr);

        Ok(master)
    }

    /// Create a master node without a listener; sessions are attached with
    /// [`serve_connection`](Self::serve_connection)
    pub fn detached(config: ReplicationConfig, storage: Arc<S>) -> ReplicationResult<Self> {
        if !config.is_master() {
            return Err(ReplicationError::NotMaster);
        }
        config.validate().map_err(ReplicationError::InvalidConfig)?;

        let created_at = storage.creation_timestamp();
        info!(
            "Initializing master node {} (database created at {})",
            config.node_id, created_at
        );

        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(MasterShared {
            identity: LocalIdentity {
                protocol_version: REPLICATION_PROTOCOL_VERSION,
                database_creation_timestamp: created_at,
                node_id: config.node_id,
            },
            registry: PeerRegistry::new(),
            clock: ReplicationClock::new(),
            cas: CasGenerator::seeded(created_at),
            write_gate: Mutex::new(()),
            replicas: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            stats: RwLock::new(ReplicationStats::default()),
            shutdown,
            config,
            storage,
        });

        let barrier_shutdown = shared.shutdown.subscribe();
        tokio::spawn(Arc::clone(&shared).time_barrier_task(barrier_shutdown));

        Ok(Self {
            shared,
            local_addr: None,
        })
    }

    /// Address the replica listener is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.shared.storage
    }

    /// Timestamp the next mutation will carry
    pub fn current_timestamp(&self) -> ReplTimestamp {
        self.shared.clock.now()
    }

    /// Run a master session with one slave over `transport`
    pub async fn serve_connection<T>(&self, transport: T) -> ReplicationResult<()>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Arc::clone(&self.shared).serve(transport, None).await
    }

    /// Read a key from local storage (not replicated)
    pub async fn get(&self, key: &StoreKey) -> ReplicationResult<Option<StoredItem>> {
        Ok(self.shared.storage.get(key).await?)
    }

    /// Conditional store (set/add/replace/cas)
    pub async fn set(&self, request: SetRequest) -> ReplicationResult<SetOutcome> {
        let shared = &self.shared;
        let _gate = shared.write_gate.lock().await;

        let op = Sarc {
            timestamp: shared.clock.now(),
            proposed_cas: shared.cas.next(),
            flags: request.flags,
            exptime: request.exptime,
            add_policy: request.add_policy,
            replace_policy: request.replace_policy,
            old_cas: request.old_cas,
            key: request.key,
            value: request.value,
        };
        shared.ensure_replicable(codec::encoded_len(&Message::Sarc(op.clone())))?;

        let outcome = shared.storage.conditional_set(&op).await?;
        if outcome == SetOutcome::Stored {
            shared.replicate(Message::Sarc(op));
        }
        Ok(outcome)
    }

    /// CAS of a key, assigning one if the value never had a CAS
    pub async fn get_cas(&self, key: StoreKey) -> ReplicationResult<Option<Cas>> {
        let shared = &self.shared;
        let _gate = shared.write_gate.lock().await;

        let op = GetCas {
            proposed_cas: shared.cas.next(),
            timestamp: shared.clock.now(),
            key,
        };
        let cas = shared.storage.get_cas(&op).await?;
        if cas == Some(op.proposed_cas) {
            shared.replicate(Message::GetCas(op));
        }
        Ok(cas)
    }

    pub async fn incr(&self, key: StoreKey, amount: u64) -> ReplicationResult<IncrDecrOutcome> {
        self.incr_decr(key, amount, true).await
    }

    pub async fn decr(&self, key: StoreKey, amount: u64) -> ReplicationResult<IncrDecrOutcome> {
        self.incr_decr(key, amount, false).await
    }

    pub async fn append(
        &self,
        key: StoreKey,
        data: impl Into<Bytes>,
    ) -> ReplicationResult<AppendPrependOutcome> {
        self.splice(key, data.into(), true).await
    }

    pub async fn prepend(
        &self,
        key: StoreKey,
        data: impl Into<Bytes>,
    ) -> ReplicationResult<AppendPrependOutcome> {
        self.splice(key, data.into(), false).await
    }

    pub async fn delete(&self, key: StoreKey) -> ReplicationResult<DeleteOutcome> {
        let shared = &self.shared;
        let _gate = shared.write_gate.lock().await;

        let op = Delete {
            timestamp: shared.clock.now(),
            key,
        };
        let outcome = shared.storage.delete(&op).await?;
        if outcome == DeleteOutcome::Deleted {
            shared.replicate(Message::Delete(op));
        }
        Ok(outcome)
    }

    async fn incr_decr(
        &self,
        key: StoreKey,
        amount: u64,
        increment: bool,
    ) -> ReplicationResult<IncrDecrOutcome> {
        let shared = &self.shared;
        let _gate = shared.write_gate.lock().await;

        let op = IncrDecr {
            timestamp: shared.clock.now(),
            proposed_cas: shared.cas.next(),
            amount,
            key,
        };
        let outcome = if increment {
            shared.storage.incr(&op).await?
        } else {
            shared.storage.decr(&op).await?
        };
        if let IncrDecrOutcome::Applied(_) = outcome {
            shared.replicate(if increment {
                Message::Incr(op)
            } else {
                Message::Decr(op)
            });
        }
        Ok(outcome)
    }

    async fn splice(
        &self,
        key: StoreKey,
        data: Bytes,
        at_end: bool,
    ) -> ReplicationResult<AppendPrependOutcome> {
        let shared = &self.shared;
        let _gate = shared.write_gate.lock().await;

        let op = AppendPrepend {
            timestamp: shared.clock.now(),
            proposed_cas: shared.cas.next(),
            key,
            data,
        };
        shared.ensure_replicable(codec::encoded_len(&Message::Append(op.clone())))?;
        // The grown value has to fit a backfill frame as well
        if let Some(current) = shared.storage.get(&op.key).await? {
            let grown = current.value.len() + op.data.len();
            shared.ensure_replicable(codec::backfill_set_len(&op.key, grown))?;
        }

        let outcome = if at_end {
            shared.storage.append(&op).await?
        } else {
            shared.storage.prepend(&op).await?
        };
        if outcome == AppendPrependOutcome::Applied {
            shared.replicate(if at_end {
                Message::Append(op)
            } else {
                Message::Prepend(op)
            });
        }
        Ok(outcome)
    }

    /// Get list of connected replicas
    pub fn list_replicas(&self) -> Vec<ReplicaInfo> {
        let mut replicas: Vec<ReplicaInfo> = self
            .shared
            .replicas
            .read()
            .values()
            .map(|r| r.info.clone())
            .collect();
        replicas.sort_by_key(|r| r.session_id);
        replicas
    }

    /// Get replication statistics
    pub fn stats(&self) -> ReplicationStats {
        let mut stats = self.shared.stats.read().clone();
        stats.master_timestamp = self.shared.clock.now().get();
        stats.connected = !self.shared.replicas.read().is_empty();
        stats
    }

    /// Stop accepting slaves and close every session
    pub fn shutdown(&self) {
        info!("Shutting down master node");
        self.shared.shutdown.send_replace(true);
    }
}

impl<S: StorageEngine> Drop for MasterNode<S> {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

impl<S: StorageEngine> MasterShared<S> {
    /// Refuse a write whose replication frame no slave could ever receive
    fn ensure_replicable(&self, frame_bytes: usize) -> ReplicationResult<()> {
        let max_frame_bytes = self.config.max_frame_bytes;
        if frame_bytes > max_frame_bytes {
            return Err(ReplicationError::ValueTooLarge {
                max_frame_bytes,
                got_bytes: frame_bytes,
            });
        }
        Ok(())
    }

    /// Queue a successfully applied mutation for every slave that asked for backfill
    fn replicate(&self, msg: Message) {
        self.broadcast(msg);
        self.stats.write().total_replicated += 1;
    }

    fn broadcast(&self, msg: Message) {
        let replicas = self.replicas.read();
        for conn in replicas.values() {
            if let Some(sender) = &conn.sender {
                // A closed channel means the session is ending; it cleans up after itself
                let _ = sender.send(msg.clone());
            }
        }
    }

    fn update_replica(&self, session_id: u64, update: impl FnOnce(&mut ReplicaConnection)) {
        if let Some(conn) = self.replicas.write().get_mut(&session_id) {
            update(conn);
        }
    }

    async fn listen_for_replicas(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!("New replica connection from {}", addr);
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                        }
                        let shared = Arc::clone(&self);
                        tokio::spawn(async move {
                            let _ = shared.serve(stream, Some(addr)).await;
                        });
                    }
                    Err(e) => {
                        warn!("Failed to accept replica connection: {}", e);
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("Replica listener stopped");
    }

    async fn time_barrier_task(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.time_barrier_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let _gate = self.write_gate.lock().await;
                    let timestamp = self.clock.advance();
                    self.broadcast(Message::TimeBarrier { timestamp });
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Run one session and deregister it afterwards
    async fn serve<T>(
        self: Arc<Self>,
        transport: T,
        address: Option<SocketAddr>,
    ) -> ReplicationResult<()>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let now = unix_now_secs();
        self.replicas.write().insert(
            session_id,
            ReplicaConnection {
                info: ReplicaInfo {
                    session_id,
                    node_id: None,
                    address,
                    phase: SessionPhase::Connecting,
                    connected_at: now,
                    last_heartbeat: now,
                    backfill_since: None,
                },
                sender: None,
            },
        );

        let mut driver = MasterSession {
            session: ReplicationSession::new(
                SessionRole::Master,
                self.identity,
                self.registry.clone(),
            ),
            io: SessionIo::new(transport, &self.config, self.shutdown.subscribe()),
            live: None,
            session_id,
            shared: Arc::clone(&self),
        };
        let result = match driver.run().await {
            Err(ReplicationError::ShuttingDown) => Ok(()),
            other => other,
        };

        if let Err(e) = &result {
            driver.session.fail(e);
        }
        driver.io.close().await;
        driver.session.close();
        self.replicas.write().remove(&session_id);

        {
            let mut stats = self.stats.write();
            stats.total_bytes += driver.io.bytes_written();
            if result.is_err() {
                stats.failed_sessions += 1;
            }
        }

        match &result {
            Ok(()) => info!("Replica session {} closed", session_id),
            Err(e) => error!(
                reason = e.reason_code(),
                "Replica session {} failed: {}", session_id, e
            ),
        }
        result
    }
}

/// Master side of one slave connection
struct MasterSession<S, T> {
    shared: Arc<MasterShared<S>>,
    session_id: u64,
    session: ReplicationSession,
    io: SessionIo<T>,
    /// Live mutations queued for this slave, once backfill started
    live: Option<mpsc::UnboundedReceiver<Message>>,
}

impl<S: StorageEngine, T: AsyncRead + AsyncWrite> MasterSession<S, T> {
    async fn run(&mut self) -> ReplicationResult<()> {
        if self.io.is_shutting_down() {
            return Ok(());
        }

        let hello = self.session.begin();
        self.io.send(&hello).await?;

        loop {
            match self.io.next_event(&mut self.live).await? {
                SessionEvent::Inbound(msg) => {
                    let actions = self.session.handle_message(msg)?;
                    self.after_inbound();
                    for action in actions {
                        match action {
                            SessionAction::Send(reply) => self.io.send(&reply).await?,
                            SessionAction::StartBackfill { since } => {
                                self.stream_backfill(since).await?
                            }
                            other => {
                                warn!("Ignoring slave-side action {:?} on master", other);
                            }
                        }
                    }
                }
                SessionEvent::Live(msg) => self.io.send(&msg).await?,
                SessionEvent::PeerClosed => {
                    debug!("Replica session {} ended by peer", self.session_id);
                    return Ok(());
                }
                SessionEvent::Shutdown => return Ok(()),
            }
        }
    }

    fn after_inbound(&self) {
        let phase = self.session.phase();
        let node_id = self.session.peer().map(|p| p.node_id);
        self.shared.update_replica(self.session_id, |conn| {
            conn.info.phase = phase;
            conn.info.node_id = node_id;
            conn.info.last_heartbeat = unix_now_secs();
        });
    }

    /// Send the backfill stream, interleaving live mutations queued meanwhile
    ///
    /// Every write is guarded by the session's shutdown and receive timeout,
    /// and slave traffic arriving meanwhile is queued for the main loop.
    async fn stream_backfill(&mut self, since: ReplTimestamp) -> ReplicationResult<()> {
        let shared = Arc::clone(&self.shared);
        let (sender, mut live) = mpsc::unbounded_channel();

        let (snapshot, time_barrier) = {
            let _gate = shared.write_gate.lock().await;
            shared.update_replica(self.session_id, |conn| {
                conn.sender = Some(sender);
                conn.info.backfill_since = Some(since.get());
            });
            // Mutations from here on carry a timestamp >= the barrier
            let time_barrier = shared.clock.advance();
            let snapshot = shared.storage.snapshot_for_backfill(since).await?;
            (snapshot, time_barrier)
        };

        let entries = snapshot.entry_count() as u64;
        info!(
            "Backfilling replica session {} since {} up to {} ({} entries)",
            self.session_id, since, time_barrier, entries
        );

        for msg in BackfillProducer::new(snapshot, time_barrier) {
            if let Message::BackfillComplete { .. } = msg {
                // Everything queued before the barrier goes out ahead of it
                while let Ok(queued) = live.try_recv() {
                    self.io.send(&queued).await?;
                }
            }
            self.io.send(&msg).await?;
            while let Ok(queued) = live.try_recv() {
                self.io.send(&queued).await?;
            }
        }

        self.live = Some(live);
        self.session.backfill_sent(time_barrier);
        self.shared.update_replica(self.session_id, |conn| {
            conn.info.phase = SessionPhase::Streaming;
        });
        self.shared.stats.write().backfill_entries += entries;

        info!(
            "Replica session {} streaming from {}",
            self.session_id, time_barrier
        );
        Ok(())
    }
}
