//! Integration tests for replication over real TCP connections
//!
//! These tests cover:
//! - Full backfill of a fresh replica
//! - Live mutations streamed after backfill
//! - Writes landing while a backfill is in flight
//! - Multiple replicas converging on the same state
//! - Replica shutdown deregistering from the master
//! - Sessions staying healthy through sustained write bursts

use bytes::Bytes;
use memrepl_server::replication::{
    MasterNode, NodeRole, ReplicaNode, ReplicationConfig, SessionPhase, SetRequest,
};
use memrepl_server::{KVConfig, KVStore, StorageEngine, StoreKey};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn key(s: &str) -> StoreKey {
    StoreKey::try_from(s).unwrap()
}

/// Helper to create a master node on an ephemeral port
async fn create_master() -> (Arc<MasterNode<KVStore>>, Arc<KVStore>, SocketAddr) {
    create_master_with_timeout(5000).await
}

async fn create_master_with_timeout(
    heartbeat_timeout_ms: u64,
) -> (Arc<MasterNode<KVStore>>, Arc<KVStore>, SocketAddr) {
    let mut config = ReplicationConfig::default();
    config.enabled = true;
    config.role = NodeRole::Master;
    config.replica_listen_address = Some("127.0.0.1:0".parse().unwrap());
    config.heartbeat_interval_ms = 100; // Fast heartbeats for testing
    config.heartbeat_timeout_ms = heartbeat_timeout_ms;
    config.time_barrier_interval_ms = 50;

    let kv = Arc::new(KVStore::new(KVConfig::default()));
    let master = MasterNode::new(config, Arc::clone(&kv)).await.unwrap();
    let addr = master.local_addr().unwrap();

    (Arc::new(master), kv, addr)
}

/// Helper to create a replica node following `master_addr`
async fn create_replica(
    master_addr: SocketAddr,
    node_id: u32,
) -> (Arc<ReplicaNode<KVStore>>, Arc<KVStore>) {
    let mut config = ReplicationConfig::default();
    config.enabled = true;
    config.role = NodeRole::Replica;
    config.node_id = node_id;
    config.master_address = Some(master_addr);
    config.auto_reconnect = true;
    config.reconnect_delay_ms = 100; // Fast reconnect for testing
    config.heartbeat_interval_ms = 100;

    let kv = Arc::new(KVStore::new(KVConfig::default()));
    let replica = ReplicaNode::new(config, Arc::clone(&kv)).await.unwrap();

    (replica, kv)
}

/// Poll until `condition` holds, panicking after ten seconds
async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn contents(kv: &KVStore) -> Vec<(StoreKey, Bytes, u32)> {
    let mut items = Vec::new();
    for k in kv.keys() {
        if let Some(item) = kv.get(&k).await.unwrap() {
            items.push((k, item.value, item.flags));
        }
    }
    items
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_backfill_over_tcp() {
    let (master, master_kv, addr) = create_master().await;

    for i in 0..100 {
        master
            .set(SetRequest::set(key(&format!("key_{:03}", i)), format!("value_{}", i)))
            .await
            .unwrap();
    }

    let (replica, replica_kv) = create_replica(addr, 2).await;

    wait_for("replica to stream", || replica.phase() == SessionPhase::Streaming).await;
    assert_eq!(replica_kv.len(), 100);
    assert_eq!(contents(&replica_kv).await, contents(&master_kv).await);

    let stats = replica.stats();
    assert!(stats.connected);
    // Range tombstones of the full reset plus one set per key
    assert!(stats.backfill_entries > 100);

    replica.shutdown();
    master.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_live_mutations_stream_to_replica() {
    let (master, master_kv, addr) = create_master().await;
    let (replica, replica_kv) = create_replica(addr, 2).await;

    wait_for("replica to stream", || replica.phase() == SessionPhase::Streaming).await;

    master
        .set(SetRequest::set(key("user:1"), "alice").with_flags(3))
        .await
        .unwrap();
    master.set(SetRequest::set(key("hits"), "0")).await.unwrap();
    for _ in 0..10 {
        master.incr(key("hits"), 1).await.unwrap();
    }
    master.prepend(key("user:1"), "@").await.unwrap();
    master.set(SetRequest::set(key("tmp"), "x")).await.unwrap();
    master.delete(key("tmp")).await.unwrap();
    master.set(SetRequest::set(key("done"), "1")).await.unwrap();

    wait_for("live stream", || replica_kv.keys().contains(&key("done"))).await;
    assert_eq!(contents(&replica_kv).await, contents(&master_kv).await);

    let hits = replica_kv.get(&key("hits")).await.unwrap().unwrap();
    assert_eq!(hits.value, Bytes::from_static(b"10"));
    let user = replica_kv.get(&key("user:1")).await.unwrap().unwrap();
    assert_eq!(user.value, Bytes::from_static(b"@alice"));
    assert_eq!(user.flags, 3);

    replica.shutdown();
    master.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_writes_during_backfill_are_not_lost() {
    let (master, master_kv, addr) = create_master().await;

    for i in 0..2000 {
        master
            .set(SetRequest::set(key(&format!("bulk_{:05}", i)), vec![b'x'; 64]))
            .await
            .unwrap();
    }

    let writer = {
        let master = Arc::clone(&master);
        tokio::spawn(async move {
            for i in 0..500 {
                master
                    .set(SetRequest::set(key(&format!("live_{:04}", i)), format!("{}", i)))
                    .await
                    .unwrap();
                if i % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            master.delete(key("bulk_00000")).await.unwrap();
        })
    };

    let (replica, replica_kv) = create_replica(addr, 2).await;
    writer.await.unwrap();
    master.set(SetRequest::set(key("zz_marker"), "end")).await.unwrap();

    wait_for("marker", || replica_kv.keys().contains(&key("zz_marker"))).await;
    assert_eq!(replica_kv.len(), master_kv.len());
    assert_eq!(contents(&replica_kv).await, contents(&master_kv).await);
    assert!(replica_kv.get(&key("bulk_00000")).await.unwrap().is_none());

    replica.shutdown();
    master.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_multiple_replicas_converge() {
    let (master, master_kv, addr) = create_master().await;
    master.set(SetRequest::set(key("seed"), "1")).await.unwrap();

    let (replica_a, kv_a) = create_replica(addr, 2).await;
    let (replica_b, kv_b) = create_replica(addr, 3).await;

    wait_for("both replicas", || {
        replica_a.phase() == SessionPhase::Streaming && replica_b.phase() == SessionPhase::Streaming
    })
    .await;
    wait_for("master registry", || master.list_replicas().len() == 2).await;

    let mut ids: Vec<_> = master
        .list_replicas()
        .iter()
        .filter_map(|r| r.node_id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec![2, 3]);

    for i in 0..50 {
        master
            .set(SetRequest::set(key(&format!("k{}", i)), format!("v{}", i)))
            .await
            .unwrap();
    }
    master.set(SetRequest::set(key("last"), "1")).await.unwrap();

    wait_for("replica a", || kv_a.keys().contains(&key("last"))).await;
    wait_for("replica b", || kv_b.keys().contains(&key("last"))).await;
    let expected = contents(&master_kv).await;
    assert_eq!(contents(&kv_a).await, expected);
    assert_eq!(contents(&kv_b).await, expected);

    replica_a.shutdown();
    replica_b.shutdown();
    master.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replica_shutdown_deregisters() {
    let (master, _master_kv, addr) = create_master().await;
    let (replica, _replica_kv) = create_replica(addr, 2).await;

    wait_for("registration", || master.list_replicas().len() == 1).await;
    wait_for("replica to stream", || replica.phase() == SessionPhase::Streaming).await;

    replica.shutdown();
    wait_for("deregistration", || master.list_replicas().is_empty()).await;
    assert!(!replica.is_connected());
    assert_eq!(replica.phase(), SessionPhase::Closed);

    master.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sustained_writes_keep_session_alive() {
    let (master, master_kv, addr) = create_master_with_timeout(500).await;
    let (replica, replica_kv) = create_replica(addr, 2).await;

    wait_for("replica to stream", || replica.phase() == SessionPhase::Streaming).await;

    // Three timeouts' worth of back-to-back writes, then silence
    let writers: Vec<_> = (0..4)
        .map(|w| {
            let master = Arc::clone(&master);
            tokio::spawn(async move {
                let started = tokio::time::Instant::now();
                let mut i = 0u64;
                while started.elapsed() < Duration::from_millis(1500) {
                    master
                        .set(SetRequest::set(key(&format!("w{}_{}", w, i % 100)), i.to_string()))
                        .await
                        .unwrap();
                    i += 1;
                }
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }
    sleep(Duration::from_secs(1)).await;

    master.set(SetRequest::set(key("zz_marker"), "end")).await.unwrap();
    wait_for("marker", || replica_kv.keys().contains(&key("zz_marker"))).await;
    assert_eq!(contents(&replica_kv).await, contents(&master_kv).await);

    assert_eq!(master.stats().failed_sessions, 0);
    assert_eq!(replica.stats().failed_sessions, 0);
    assert_eq!(replica.phase(), SessionPhase::Streaming);
    assert_eq!(master.list_replicas().len(), 1);

    replica.shutdown();
    master.shutdown();
}
