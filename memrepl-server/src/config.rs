use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::KVConfig;
use crate::replication::ReplicationConfig;

/// Main server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub kv_store: KVStoreConfig,
    pub logging: LoggingConfig,
    pub replication: ReplicationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KVStoreConfig {
    pub max_memory_mb: usize,
    /// Deletions remembered for partial backfill
    pub deletion_history: usize,
    /// Hash partitions used for full-reset range tombstones
    pub backfill_partitions: u32,
    pub expiry_cleanup_interval_ms: u64,
}

impl Default for KVStoreConfig {
    fn default() -> Self {
        let kv = KVConfig::default();
        Self {
            max_memory_mb: kv.max_memory_mb,
            deletion_history: kv.deletion_history,
            backfill_partitions: kv.backfill_partitions,
            expiry_cleanup_interval_ms: kv.expiry_cleanup_interval_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl ServerConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: ServerConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Convert to KVConfig
    pub fn to_kv_config(&self) -> KVConfig {
        KVConfig {
            max_memory_mb: self.kv_store.max_memory_mb,
            deletion_history: self.kv_store.deletion_history,
            backfill_partitions: self.kv_store.backfill_partitions.max(1),
            expiry_cleanup_interval_ms: self.kv_store.expiry_cleanup_interval_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::NodeRole;

    #[test]
    fn test_load_replica_config() {
        let yaml = r#"
kv_store:
  deletion_history: 500
  backfill_partitions: 4
logging:
  level: debug
  format: pretty
replication:
  enabled: true
  role: replica
  node_id: 7
  master_address: "127.0.0.1:15501"
  heartbeat_timeout_ms: 3000
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memrepl.yml");
        fs::write(&path, yaml).unwrap();

        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.replication.role, NodeRole::Replica);
        assert_eq!(config.replication.node_id, 7);
        assert_eq!(config.replication.heartbeat_timeout_ms, 3000);
        assert_eq!(config.replication.heartbeat_interval_ms, 1000);
        assert!(config.replication.validate().is_ok());

        let kv = config.to_kv_config();
        assert_eq!(kv.deletion_history, 500);
        assert_eq!(kv.backfill_partitions, 4);
        assert_eq!(kv.max_memory_mb, 4096);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(ServerConfig::from_file("/nonexistent/memrepl.yml").is_err());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: ServerConfig = serde_yaml::from_str("{}").unwrap();
        assert!(!config.replication.enabled);
        assert_eq!(config.logging.level, "info");
    }
}
