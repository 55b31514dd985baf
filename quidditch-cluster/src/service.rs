//! tarpc service definitions for the admin, data and consensus-peer RPC
//! surfaces, plus their wire types.
//!
//! Transport is tarpc's TCP serde transport with the bincode codec; every
//! call site wraps the await in its own deadline.

use crate::allocator::{AllocationPlan, MoveDecision};
use crate::consensus::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use crate::error::ClusterError;
use crate::state::{IndexMeta, NodeMeta, ShardRouting};
use quidditch::aggregations::AggPartial;
use quidditch::schema::IndexSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// `<index>/<shard_id>`, the data-plane shard handle.
pub fn shard_key(index: &str, shard_id: u32) -> String {
    format!("{index}/{shard_id}")
}

/// Split a shard key back into `(index, shard_id)`.
pub fn parse_shard_key(key: &str) -> Result<(String, u32), ClusterError> {
    let (index, shard) = key
        .rsplit_once('/')
        .ok_or_else(|| ClusterError::BadRequest(format!("malformed shard key {key}")))?;
    let shard_id = shard
        .parse()
        .map_err(|_| ClusterError::BadRequest(format!("malformed shard key {key}")))?;
    Ok((index.to_string(), shard_id))
}

// ============================================================================
// Admin surface
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateIndexRequest {
    pub name: String,
    pub num_shards: u32,
    pub num_replicas: u32,
    pub schema: IndexSchema,
}

/// Which sections of the cluster state a read should include.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StateProjection {
    pub indices: bool,
    pub nodes: bool,
    pub routing: bool,
}

impl Default for StateProjection {
    fn default() -> Self {
        Self {
            indices: true,
            nodes: true,
            routing: true,
        }
    }
}

/// A projected snapshot of the cluster state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStateView {
    pub version: u64,
    pub cluster_uuid: String,
    pub indices: Option<BTreeMap<String, IndexMeta>>,
    pub nodes: Option<BTreeMap<String, NodeMeta>>,
    pub shard_routing: Option<Vec<ShardRouting>>,
}

#[tarpc::service]
pub trait MasterRpc {
    /// Read-only snapshot with optional projection.
    async fn get_cluster_state(projection: StateProjection) -> Result<ClusterStateView, ClusterError>;

    /// Long-poll: resolves with the newest state once `version > since`,
    /// or with the current state at the server's poll deadline.
    async fn watch_cluster_state(since: u64) -> Result<ClusterStateView, ClusterError>;

    async fn create_index(request: CreateIndexRequest) -> Result<u64, ClusterError>;
    async fn delete_index(name: String) -> Result<u64, ClusterError>;
    async fn update_index_settings(
        name: String,
        num_replicas: Option<u32>,
    ) -> Result<u64, ClusterError>;
    async fn get_index_metadata(name: String) -> Result<IndexMeta, ClusterError>;

    async fn allocate_shards(index: String) -> Result<AllocationPlan, ClusterError>;
    async fn rebalance_shards() -> Result<Vec<MoveDecision>, ClusterError>;

    async fn register_node(node: NodeMeta) -> Result<u64, ClusterError>;
    async fn unregister_node(node_id: String) -> Result<u64, ClusterError>;
    async fn node_heartbeat(node_id: String) -> Result<u64, ClusterError>;
}

// ============================================================================
// Data surface
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardSearchRequest {
    pub shard_key: String,
    pub query: Value,
    pub filter: Option<Vec<u8>>,
    pub from: usize,
    pub size: usize,
    pub aggs: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireHit {
    pub internal_id: u64,
    pub doc_id: String,
    pub score: f32,
    pub fields: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardSearchReply {
    pub total_hits: usize,
    pub max_score: f32,
    pub hits: Vec<WireHit>,
    pub aggregations: BTreeMap<String, AggPartial>,
    pub filter_evaluated: u64,
    pub filter_matched: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardStats {
    pub shard_key: String,
    pub doc_count: usize,
}

#[tarpc::service]
pub trait DataRpc {
    async fn create_shard(
        index: String,
        shard_id: u32,
        schema: IndexSchema,
    ) -> Result<(), ClusterError>;

    /// Drop a shard and its on-disk segment files.
    async fn remove_shard(index: String, shard_id: u32) -> Result<(), ClusterError>;

    async fn index_document(
        shard_key: String,
        doc_id: String,
        doc: Value,
    ) -> Result<(), ClusterError>;

    async fn search(request: ShardSearchRequest) -> Result<ShardSearchReply, ClusterError>;

    async fn get_document(shard_key: String, doc_id: String) -> Result<Option<Value>, ClusterError>;
    async fn delete_document(shard_key: String, doc_id: String) -> Result<(), ClusterError>;

    async fn refresh(shard_key: String) -> Result<(), ClusterError>;
    async fn flush(shard_key: String) -> Result<(), ClusterError>;

    async fn shard_stats(shard_key: String) -> Result<ShardStats, ClusterError>;

    /// Cheap reachability probe.
    async fn ping() -> String;
}

// ============================================================================
// Consensus peer surface
// ============================================================================

#[tarpc::service]
pub trait RaftRpc {
    async fn request_vote(request: VoteRequest) -> VoteResponse;
    async fn append_entries(request: AppendEntriesRequest) -> AppendEntriesResponse;
    async fn install_snapshot(
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, ClusterError>;
}
