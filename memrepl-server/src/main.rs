use anyhow::{Context, Result};
use clap::Parser;
use memrepl_server::config::LogFormat;
use memrepl_server::{KVStore, MasterNode, NodeRole, ReplicaNode, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "memrepl-server")]
#[command(about = "Replicated in-memory key-value store", long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yml")]
    config: PathBuf,
}

fn init_tracing(config: &ServerConfig) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = if args.config.exists() {
        ServerConfig::from_file(&args.config)
            .with_context(|| format!("failed to load {}", args.config.display()))?
    } else {
        ServerConfig::default()
    };

    init_tracing(&config);
    info!("Starting memrepl server v{}", env!("CARGO_PKG_VERSION"));
    if !args.config.exists() {
        warn!(
            "Config file {} not found, using defaults",
            args.config.display()
        );
    }

    config
        .replication
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid replication config: {}", e))?;

    // Create KV store
    let store = Arc::new(KVStore::new(config.to_kv_config()));
    store.start_expiry_cleanup();

    let replication = config.replication.clone();
    match (replication.enabled, replication.role) {
        (true, NodeRole::Master) => {
            let master = MasterNode::new(replication, Arc::clone(&store)).await?;
            info!(
                "Master ready, accepting replicas on {:?}",
                master.local_addr()
            );
            tokio::signal::ctrl_c().await?;
            master.shutdown();
        }
        (true, NodeRole::Replica) => {
            let replica = ReplicaNode::new(replication, Arc::clone(&store)).await?;
            info!("Replica following {:?}", config.replication.master_address);
            tokio::signal::ctrl_c().await?;
            replica.shutdown();
        }
        _ => {
            info!("Replication disabled, running standalone");
            tokio::signal::ctrl_c().await?;
        }
    }

    info!("Shutting down");
    Ok(())
}
