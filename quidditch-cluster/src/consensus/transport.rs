//! Peer RPC messages and the transport seam.
//!
//! The consensus node talks to its peers through [`RaftTransport`]; the
//! production implementation rides tarpc (see `client`), while tests plug
//! in an in-process transport to run whole clusters in one process.

use super::log::{LogEntry, LogIndex, Term};
use super::storage::Snapshot;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate: String,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader: String,
    /// Admin RPC endpoint of the leader, forwarded to clients as the
    /// NotLeader hint.
    pub leader_rpc_addr: String,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub match_index: LogIndex,
    /// Where the leader should back off to after a log mismatch.
    pub conflict_index: Option<LogIndex>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader: String,
    pub leader_rpc_addr: String,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
}

/// Outbound peer calls. Peers are addressed by their raft endpoint.
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn request_vote(&self, peer: &str, request: VoteRequest) -> Result<VoteResponse>;

    async fn append_entries(
        &self,
        peer: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        peer: &str,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}
