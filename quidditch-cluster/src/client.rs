//! RPC clients over tarpc's TCP transport with connection reuse.
//!
//! Connections are pooled per address; a transport error evicts the pooled
//! client so the next call reconnects. Every call carries its own timeout
//! wrapped around the await.

use crate::consensus::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftTransport, VoteRequest, VoteResponse,
};
use crate::error::{ClusterError, Result};
use crate::service::{DataRpcClient, MasterRpcClient, RaftRpcClient};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tarpc::tokio_serde::formats::Bincode;
use tarpc::{client, context};

/// Default per-call deadline when the caller supplies none.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

async fn connect_timeout<T, F>(timeout: Duration, connect: F) -> Result<T>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(client)) => Ok(client),
        Ok(Err(e)) => Err(ClusterError::Transport(e.to_string())),
        Err(_) => Err(ClusterError::Timeout("connect".to_string())),
    }
}

pub async fn connect_master(addr: &str, timeout: Duration) -> Result<MasterRpcClient> {
    let transport = connect_timeout(
        timeout,
        tarpc::serde_transport::tcp::connect(addr, Bincode::default),
    )
    .await?;
    Ok(MasterRpcClient::new(client::Config::default(), transport).spawn())
}

pub async fn connect_data(addr: &str, timeout: Duration) -> Result<DataRpcClient> {
    let transport = connect_timeout(
        timeout,
        tarpc::serde_transport::tcp::connect(addr, Bincode::default),
    )
    .await?;
    Ok(DataRpcClient::new(client::Config::default(), transport).spawn())
}

pub async fn connect_raft(addr: &str, timeout: Duration) -> Result<RaftRpcClient> {
    let transport = connect_timeout(
        timeout,
        tarpc::serde_transport::tcp::connect(addr, Bincode::default),
    )
    .await?;
    Ok(RaftRpcClient::new(client::Config::default(), transport).spawn())
}

/// Map a tarpc call error onto the cluster taxonomy.
pub fn rpc_error(err: tarpc::client::RpcError) -> ClusterError {
    match err {
        tarpc::client::RpcError::DeadlineExceeded => {
            ClusterError::Timeout("rpc deadline exceeded".to_string())
        }
        other => ClusterError::Transport(other.to_string()),
    }
}

/// Pooled data-plane clients keyed by node address.
#[derive(Default)]
pub struct DataClientPool {
    clients: Mutex<HashMap<String, DataRpcClient>>,
}

impl DataClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, addr: &str) -> Result<DataRpcClient> {
        if let Some(client) = self.clients.lock().get(addr) {
            return Ok(client.clone());
        }
        let client = connect_data(addr, DEFAULT_RPC_TIMEOUT).await?;
        self.clients
            .lock()
            .insert(addr.to_string(), client.clone());
        Ok(client)
    }

    /// Drop a pooled client after a transport failure so the next call
    /// reconnects.
    pub fn evict(&self, addr: &str) {
        self.clients.lock().remove(addr);
    }
}

/// Production raft transport: one pooled tarpc client per peer.
pub struct TarpcRaftTransport {
    timeout: Duration,
    clients: Mutex<HashMap<String, RaftRpcClient>>,
}

impl TarpcRaftTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, peer: &str) -> Result<RaftRpcClient> {
        if let Some(client) = self.clients.lock().get(peer) {
            return Ok(client.clone());
        }
        let client = connect_raft(peer, self.timeout).await?;
        self.clients.lock().insert(peer.to_string(), client.clone());
        Ok(client)
    }

    fn evict(&self, peer: &str) {
        self.clients.lock().remove(peer);
    }
}

#[async_trait]
impl RaftTransport for TarpcRaftTransport {
    async fn request_vote(&self, peer: &str, request: VoteRequest) -> Result<VoteResponse> {
        let client = self.client(peer).await?;
        client.request_vote(context::current(), request).await.map_err(|e| {
            self.evict(peer);
            rpc_error(e)
        })
    }

    async fn append_entries(
        &self,
        peer: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let client = self.client(peer).await?;
        client
            .append_entries(context::current(), request)
            .await
            .map_err(|e| {
                self.evict(peer);
                rpc_error(e)
            })
    }

    async fn install_snapshot(
        &self,
        peer: &str,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let client = self.client(peer).await?;
        match client.install_snapshot(context::current(), request).await {
            Ok(result) => result,
            Err(e) => {
                self.evict(peer);
                Err(rpc_error(e))
            }
        }
    }
}
