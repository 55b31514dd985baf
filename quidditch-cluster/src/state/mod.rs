//! Replicated cluster state: index metadata, node membership and shard
//! routing.
//!
//! The state machine owns every entity here. Mutation happens only through
//! committed [`Command`]s; everything else reads cloned snapshots. BTreeMap
//! containers keep iteration order deterministic across replicas.

mod command;
mod machine;

pub use command::Command;
pub use machine::StateMachine;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key of one shard copy: `(index, shard_id, node_id)`.
pub type RoutingKey = (String, u32, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Creating,
    Open,
    Closed,
    Deleting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Master,
    Coordination,
    Data,
    Ingest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardState {
    Unassigned,
    Initializing,
    Started,
    Relocating,
}

/// Metadata of one index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMeta {
    pub name: String,
    pub uuid: String,
    pub version: u64,
    /// Immutable for the index's lifetime; routing depends on it.
    pub num_shards: u32,
    pub num_replicas: u32,
    pub state: IndexState,
    pub created_at_ms: i64,
    pub schema: quidditch::schema::IndexSchema,
}

/// Metadata of one cluster node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub node_id: String,
    pub role: NodeRole,
    pub address: String,
    pub port: u16,
    pub status: NodeStatus,
    pub last_heartbeat_ms: i64,
}

impl NodeMeta {
    /// The node's data/admin RPC endpoint.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn is_data(&self) -> bool {
        self.role == NodeRole::Data
    }

    pub fn is_healthy(&self) -> bool {
        self.status == NodeStatus::Healthy
    }
}

/// One shard copy's routing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRouting {
    pub index: String,
    pub shard_id: u32,
    pub is_primary: bool,
    pub node_id: String,
    pub state: ShardState,
    pub version: u64,
}

impl ShardRouting {
    pub fn key(&self) -> RoutingKey {
        (self.index.clone(), self.shard_id, self.node_id.clone())
    }
}

/// The single versioned cluster state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterState {
    /// Bumped exactly once per successfully applied command.
    pub version: u64,
    /// Set once on first initialization.
    pub cluster_uuid: String,
    pub indices: BTreeMap<String, IndexMeta>,
    pub nodes: BTreeMap<String, NodeMeta>,
    pub shard_routing: BTreeMap<RoutingKey, ShardRouting>,
}

impl ClusterState {
    pub fn new(cluster_uuid: String) -> Self {
        Self {
            cluster_uuid,
            ..Default::default()
        }
    }

    pub fn index(&self, name: &str) -> Option<&IndexMeta> {
        self.indices.get(name)
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeMeta> {
        self.nodes.get(node_id)
    }

    /// Healthy nodes carrying the data role, in id order.
    pub fn healthy_data_nodes(&self) -> Vec<&NodeMeta> {
        self.nodes
            .values()
            .filter(|n| n.is_data() && n.is_healthy())
            .collect()
    }

    /// All routing entries of one index, shard-id then node-id order.
    pub fn routing_for_index(&self, index: &str) -> Vec<&ShardRouting> {
        self.shard_routing
            .values()
            .filter(|r| r.index == index)
            .collect()
    }

    /// Every copy of one shard.
    pub fn routing_for_shard(&self, index: &str, shard_id: u32) -> Vec<&ShardRouting> {
        self.shard_routing
            .values()
            .filter(|r| r.index == index && r.shard_id == shard_id)
            .collect()
    }

    /// The primary copy of one shard, if routed.
    pub fn primary_of(&self, index: &str, shard_id: u32) -> Option<&ShardRouting> {
        self.routing_for_shard(index, shard_id)
            .into_iter()
            .find(|r| r.is_primary)
    }

    /// All routing entries hosted by one node.
    pub fn shards_on_node(&self, node_id: &str) -> Vec<&ShardRouting> {
        self.shard_routing
            .values()
            .filter(|r| r.node_id == node_id)
            .collect()
    }

    /// Shard copies per node across the whole cluster; every known data
    /// node appears even when empty, so placement sees fresh nodes.
    pub fn shard_counts_by_node(&self) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> = self
            .nodes
            .values()
            .filter(|n| n.is_data())
            .map(|n| (n.node_id.clone(), 0))
            .collect();
        for routing in self.shard_routing.values() {
            *counts.entry(routing.node_id.clone()).or_insert(0) += 1;
        }
        counts
    }
}
