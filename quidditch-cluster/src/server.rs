//! tarpc servers for the three RPC surfaces.
//!
//! Each `serve_*` binds a TCP listener and spawns a task that accepts
//! channels and executes requests; the bound address is returned so
//! callers (and tests) can bind port 0.

use crate::consensus::{
    AppendEntriesRequest, AppendEntriesResponse, ConsensusNode, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use crate::data::DataNode;
use crate::error::{ClusterError, Result};
use crate::master::MasterService;
use crate::service::{
    ClusterStateView, CreateIndexRequest, DataRpc, MasterRpc, RaftRpc, ShardSearchReply,
    ShardSearchRequest, ShardStats, StateProjection,
};
use crate::state::{IndexMeta, NodeMeta};
use futures::{future, StreamExt};
use quidditch::schema::IndexSchema;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Bincode;
use tokio::task::JoinHandle;

const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;
const MAX_CHANNELS: usize = 256;

macro_rules! serve_loop {
    ($listener:expr, $make_server:expr) => {{
        let mut listener = $listener;
        listener.config_mut().max_frame_length(MAX_FRAME_BYTES);
        let local_addr = listener.local_addr();
        let handle = tokio::spawn(async move {
            listener
                .filter_map(|r| future::ready(r.ok()))
                .map(server::BaseChannel::with_defaults)
                .map(|channel| {
                    let served = $make_server();
                    channel
                        .execute(served)
                        .for_each(|response| async move {
                            tokio::spawn(response);
                        })
                })
                .buffer_unordered(MAX_CHANNELS)
                .for_each(|_| async {})
                .await;
        });
        (local_addr, handle)
    }};
}

// ============================================================================
// Master surface
// ============================================================================

#[derive(Clone)]
pub struct MasterServer(pub Arc<MasterService>);

impl MasterRpc for MasterServer {
    async fn get_cluster_state(
        self,
        _: tarpc::context::Context,
        projection: StateProjection,
    ) -> Result<ClusterStateView> {
        Ok(self.0.cluster_state(projection))
    }

    async fn watch_cluster_state(
        self,
        _: tarpc::context::Context,
        since: u64,
    ) -> Result<ClusterStateView> {
        Ok(self.0.watch_cluster_state(since).await)
    }

    async fn create_index(
        self,
        _: tarpc::context::Context,
        request: CreateIndexRequest,
    ) -> Result<u64> {
        self.0.create_index(request).await
    }

    async fn delete_index(self, _: tarpc::context::Context, name: String) -> Result<u64> {
        self.0.delete_index(name).await
    }

    async fn update_index_settings(
        self,
        _: tarpc::context::Context,
        name: String,
        num_replicas: Option<u32>,
    ) -> Result<u64> {
        self.0.update_index_settings(name, num_replicas).await
    }

    async fn get_index_metadata(
        self,
        _: tarpc::context::Context,
        name: String,
    ) -> Result<IndexMeta> {
        self.0.index_metadata(&name)
    }

    async fn allocate_shards(
        self,
        _: tarpc::context::Context,
        index: String,
    ) -> Result<crate::allocator::AllocationPlan> {
        self.0.allocate_index(&index).await
    }

    async fn rebalance_shards(
        self,
        _: tarpc::context::Context,
    ) -> Result<Vec<crate::allocator::MoveDecision>> {
        self.0.rebalance().await
    }

    async fn register_node(self, _: tarpc::context::Context, node: NodeMeta) -> Result<u64> {
        self.0.register_node(node).await
    }

    async fn unregister_node(self, _: tarpc::context::Context, node_id: String) -> Result<u64> {
        self.0.unregister_node(node_id).await
    }

    async fn node_heartbeat(self, _: tarpc::context::Context, node_id: String) -> Result<u64> {
        self.0.heartbeat(node_id).await
    }
}

pub async fn serve_master(
    addr: &str,
    master: Arc<MasterService>,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tarpc::serde_transport::tcp::listen(addr, Bincode::default)
        .await
        .map_err(|e| ClusterError::Transport(format!("bind {addr}: {e}")))?;
    tracing::info!(addr = %listener.local_addr(), "master RPC listening");
    Ok(serve_loop!(listener, || MasterServer(master.clone()).serve()))
}

// ============================================================================
// Data surface
// ============================================================================

#[derive(Clone)]
pub struct DataServer(pub Arc<DataNode>);

impl DataRpc for DataServer {
    async fn create_shard(
        self,
        _: tarpc::context::Context,
        index: String,
        shard_id: u32,
        schema: IndexSchema,
    ) -> Result<()> {
        self.0.create_shard(&index, shard_id, schema)
    }

    async fn remove_shard(
        self,
        _: tarpc::context::Context,
        index: String,
        shard_id: u32,
    ) -> Result<()> {
        self.0.remove_shard(&index, shard_id)
    }

    async fn index_document(
        self,
        _: tarpc::context::Context,
        shard_key: String,
        doc_id: String,
        doc: Value,
    ) -> Result<()> {
        self.0.index_document(&shard_key, &doc_id, &doc)
    }

    async fn search(
        self,
        _: tarpc::context::Context,
        request: ShardSearchRequest,
    ) -> Result<ShardSearchReply> {
        self.0.search(request).await
    }

    async fn get_document(
        self,
        _: tarpc::context::Context,
        shard_key: String,
        doc_id: String,
    ) -> Result<Option<Value>> {
        self.0.get_document(&shard_key, &doc_id)
    }

    async fn delete_document(
        self,
        _: tarpc::context::Context,
        shard_key: String,
        doc_id: String,
    ) -> Result<()> {
        self.0.delete_document(&shard_key, &doc_id)
    }

    async fn refresh(self, _: tarpc::context::Context, shard_key: String) -> Result<()> {
        self.0.refresh(&shard_key)
    }

    async fn flush(self, _: tarpc::context::Context, shard_key: String) -> Result<()> {
        self.0.flush(&shard_key)
    }

    async fn shard_stats(
        self,
        _: tarpc::context::Context,
        shard_key: String,
    ) -> Result<ShardStats> {
        self.0.stats(&shard_key)
    }

    async fn ping(self, _: tarpc::context::Context) -> String {
        "pong".to_string()
    }
}

pub async fn serve_data(
    addr: &str,
    node: Arc<DataNode>,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tarpc::serde_transport::tcp::listen(addr, Bincode::default)
        .await
        .map_err(|e| ClusterError::Transport(format!("bind {addr}: {e}")))?;
    tracing::info!(addr = %listener.local_addr(), "data RPC listening");
    Ok(serve_loop!(listener, || DataServer(node.clone()).serve()))
}

// ============================================================================
// Consensus peer surface
// ============================================================================

#[derive(Clone)]
pub struct RaftServer(pub Arc<ConsensusNode>);

impl RaftRpc for RaftServer {
    async fn request_vote(
        self,
        _: tarpc::context::Context,
        request: VoteRequest,
    ) -> VoteResponse {
        self.0.handle_request_vote(request)
    }

    async fn append_entries(
        self,
        _: tarpc::context::Context,
        request: AppendEntriesRequest,
    ) -> AppendEntriesResponse {
        self.0.handle_append_entries(request)
    }

    async fn install_snapshot(
        self,
        _: tarpc::context::Context,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.0.handle_install_snapshot(request)
    }
}

pub async fn serve_raft(
    addr: &str,
    node: Arc<ConsensusNode>,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tarpc::serde_transport::tcp::listen(addr, Bincode::default)
        .await
        .map_err(|e| ClusterError::Transport(format!("bind {addr}: {e}")))?;
    tracing::info!(addr = %listener.local_addr(), "raft RPC listening");
    Ok(serve_loop!(listener, || RaftServer(node.clone()).serve()))
}
