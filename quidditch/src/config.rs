//! Node configuration.
//!
//! Loaded from a TOML file; unknown keys are rejected so a typoed option
//! can never silently fall back to a default. CLI flags override file
//! values at the binary layer.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Unique identifier of this node in the cluster.
    pub node_id: String,

    /// Interface the node binds its listeners to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Port for consensus peer traffic.
    #[serde(default = "default_raft_port")]
    pub raft_port: u16,

    /// Port for the admin/data RPC surface.
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,

    /// Base directory for all persisted state.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Initial peer addresses (`host:raft_port`). An empty list bootstraps
    /// a fresh single-node cluster.
    #[serde(default)]
    pub peers: Vec<String>,

    /// Seconds without a heartbeat before a node is considered offline.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    /// Consensus log entries before a snapshot is attempted.
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,

    /// Per-shard indexing buffer in megabytes.
    #[serde(default = "default_ram_buffer_mb")]
    pub ram_buffer_mb: usize,

    /// Whether closing a shard commits pending writes first.
    #[serde(default = "default_true")]
    pub commit_on_close: bool,
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_raft_port() -> u16 {
    7310
}

fn default_grpc_port() -> u16 {
    7311
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_heartbeat_timeout() -> u64 {
    30
}

fn default_snapshot_threshold() -> u64 {
    1024
}

fn default_ram_buffer_mb() -> usize {
    64
}

fn default_true() -> bool {
    true
}

impl NodeConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: NodeConfig =
            toml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(Error::Config("node_id must not be empty".to_string()));
        }
        if self.ram_buffer_mb == 0 {
            return Err(Error::Config("ram_buffer_mb must be positive".to_string()));
        }
        if self.heartbeat_timeout_secs == 0 {
            return Err(Error::Config(
                "heartbeat_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Address this node's consensus listener binds to.
    pub fn raft_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.raft_port)
    }

    /// Address this node's RPC listener binds to.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.grpc_port)
    }

    /// Directory holding consensus log, stable state and snapshots.
    pub fn consensus_dir(&self) -> PathBuf {
        self.data_dir.join("consensus")
    }

    /// Directory holding one subdirectory per hosted shard.
    pub fn shards_dir(&self) -> PathBuf {
        self.data_dir.join("shards")
    }
}
