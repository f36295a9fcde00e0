pub mod config;
pub mod core;
pub mod replication;

// Re-export commonly used types
pub use config::ServerConfig;
pub use core::{KVConfig, KVStore, StoreError};
pub use replication::{
    MasterNode, Message, NodeRole, ReplicaNode, ReplicationConfig, ReplicationError,
    ReplicationStats, SetRequest, StorageEngine, StoreKey,
};
