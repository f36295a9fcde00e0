use super::frame::DEFAULT_MAX_FRAME_BYTES;
use super::types::NodeRole;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Enable replication
    pub enabled: bool,

    /// Node role (master, replica, standalone)
    pub role: NodeRole,

    /// Identifier announced to peers; must be unique and non-zero
    pub node_id: u32,

    /// Master address (for replica nodes)
    pub master_address: Option<SocketAddr>,

    /// Address the master accepts slave connections on
    pub replica_listen_address: Option<SocketAddr>,

    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,

    /// A session without inbound traffic for this long is failed
    pub heartbeat_timeout_ms: u64,

    /// Interval between time barriers emitted by the master
    pub time_barrier_interval_ms: u64,

    /// Live messages a slave may hold back while backfilling
    pub backfill_buffer_limit: usize,

    /// Largest accepted frame payload
    pub max_frame_bytes: usize,

    /// Automatic reconnect on disconnect
    pub auto_reconnect: bool,

    /// Reconnect delay in milliseconds
    pub reconnect_delay_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            role: NodeRole::Standalone,
            node_id: 1,
            master_address: None,
            replica_listen_address: None,
            heartbeat_interval_ms: 1000,     // 1 second heartbeat
            heartbeat_timeout_ms: 5000,      // 5 seconds of silence
            time_barrier_interval_ms: 1000,  // 1 second
            backfill_buffer_limit: 100_000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            auto_reconnect: true,
            reconnect_delay_ms: 5000, // 5 seconds
        }
    }
}

impl ReplicationConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }

        match self.role {
            NodeRole::Replica => {
                if self.master_address.is_none() {
                    return Err("Replica node requires master_address".to_string());
                }
            }
            NodeRole::Master => {
                if self.replica_listen_address.is_none() {
                    return Err("Master node requires replica_listen_address".to_string());
                }
                if self.time_barrier_interval_ms == 0 {
                    return Err("time_barrier_interval_ms must be greater than zero".to_string());
                }
            }
            NodeRole::Standalone => {
                return Err("Standalone node cannot have replication enabled".to_string());
            }
        }

        if self.node_id == 0 {
            return Err("node_id must be non-zero".to_string());
        }
        if self.heartbeat_interval_ms == 0 {
            return Err("heartbeat_interval_ms must be greater than zero".to_string());
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(format!(
                "heartbeat_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            ));
        }
        if self.backfill_buffer_limit == 0 {
            return Err("backfill_buffer_limit must be greater than zero".to_string());
        }
        if self.max_frame_bytes == 0 || self.max_frame_bytes > u32::MAX as usize {
            return Err("max_frame_bytes must be between 1 and 4294967295".to_string());
        }

        Ok(())
    }

    /// Check if this node is a master
    pub fn is_master(&self) -> bool {
        self.enabled && self.role == NodeRole::Master
    }

    /// Check if this node is a replica
    pub fn is_replica(&self) -> bool {
        self.enabled && self.role == NodeRole::Replica
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn time_barrier_interval(&self) -> Duration {
        Duration::from_millis(self.time_barrier_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
