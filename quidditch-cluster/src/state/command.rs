//! The closed command set of the replicated state machine.
//!
//! Commands carry every non-deterministic input (timestamps, uuids) so
//! apply is a pure function of `(state, command)` and every replica
//! converges. Idempotent payloads let callers re-submit after an unknown
//! outcome.

use super::{
    ClusterState, IndexMeta, IndexState, NodeMeta, NodeStatus, ShardRouting, ShardState,
};
use crate::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    CreateIndex {
        name: String,
        uuid: String,
        num_shards: u32,
        num_replicas: u32,
        schema: quidditch::schema::IndexSchema,
        created_at_ms: i64,
    },
    DeleteIndex {
        name: String,
    },
    UpdateIndex {
        name: String,
        num_replicas: Option<u32>,
        state: Option<IndexState>,
    },
    RegisterNode {
        node: NodeMeta,
    },
    UnregisterNode {
        node_id: String,
    },
    UpdateNode {
        node_id: String,
        status: NodeStatus,
    },
    Heartbeat {
        node_id: String,
        timestamp_ms: i64,
    },
    AllocateShard {
        routing: ShardRouting,
    },
    DeallocateShard {
        index: String,
        shard_id: u32,
        node_id: String,
    },
    UpdateShard {
        index: String,
        shard_id: u32,
        node_id: String,
        state: ShardState,
        version: u64,
    },
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::CreateIndex { .. } => "create_index",
            Command::DeleteIndex { .. } => "delete_index",
            Command::UpdateIndex { .. } => "update_index",
            Command::RegisterNode { .. } => "register_node",
            Command::UnregisterNode { .. } => "unregister_node",
            Command::UpdateNode { .. } => "update_node",
            Command::Heartbeat { .. } => "heartbeat",
            Command::AllocateShard { .. } => "allocate_shard",
            Command::DeallocateShard { .. } => "deallocate_shard",
            Command::UpdateShard { .. } => "update_shard",
        }
    }
}

impl ClusterState {
    /// Apply one command. On success the state version advances by exactly
    /// one; a failed command leaves the state untouched.
    pub fn apply(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::CreateIndex {
                name,
                uuid,
                num_shards,
                num_replicas,
                schema,
                created_at_ms,
            } => {
                if self.indices.contains_key(name) {
                    return Err(ClusterError::AlreadyExists(format!("index {name}")));
                }
                if *num_shards == 0 {
                    return Err(ClusterError::BadRequest(
                        "num_shards must be at least 1".to_string(),
                    ));
                }
                self.indices.insert(
                    name.clone(),
                    IndexMeta {
                        name: name.clone(),
                        uuid: uuid.clone(),
                        version: 1,
                        num_shards: *num_shards,
                        num_replicas: *num_replicas,
                        state: IndexState::Creating,
                        created_at_ms: *created_at_ms,
                        schema: schema.clone(),
                    },
                );
            }

            Command::DeleteIndex { name } => {
                if self.indices.remove(name).is_none() {
                    return Err(ClusterError::NotFound(format!("index {name}")));
                }
                // Routed copies fall away with the index; data-node cleanup
                // happens asynchronously on the master.
                self.shard_routing.retain(|_, r| &r.index != name);
            }

            Command::UpdateIndex {
                name,
                num_replicas,
                state,
            } => {
                let meta = self
                    .indices
                    .get_mut(name)
                    .ok_or_else(|| ClusterError::NotFound(format!("index {name}")))?;
                if let Some(replicas) = num_replicas {
                    meta.num_replicas = *replicas;
                }
                if let Some(new_state) = state {
                    meta.state = *new_state;
                }
                meta.version += 1;
            }

            Command::RegisterNode { node } => {
                // Idempotent overwrite.
                self.nodes.insert(node.node_id.clone(), node.clone());
            }

            Command::UnregisterNode { node_id } => {
                self.nodes.remove(node_id);
                self.unassign_node_shards(node_id);
            }

            Command::UpdateNode { node_id, status } => {
                let node = self
                    .nodes
                    .get_mut(node_id)
                    .ok_or_else(|| ClusterError::NotFound(format!("node {node_id}")))?;
                node.status = *status;
                if *status == NodeStatus::Offline {
                    self.unassign_node_shards(node_id);
                }
            }

            Command::Heartbeat {
                node_id,
                timestamp_ms,
            } => {
                let node = self
                    .nodes
                    .get_mut(node_id)
                    .ok_or_else(|| ClusterError::NotFound(format!("node {node_id}")))?;
                node.last_heartbeat_ms = *timestamp_ms;
                if node.status == NodeStatus::Offline {
                    node.status = NodeStatus::Healthy;
                }
            }

            Command::AllocateShard { routing } => {
                if routing.is_primary {
                    // Keep the one-primary-per-shard invariant on overwrite.
                    self.shard_routing.retain(|_, r| {
                        !(r.index == routing.index
                            && r.shard_id == routing.shard_id
                            && r.is_primary
                            && r.node_id != routing.node_id)
                    });
                }
                self.shard_routing.insert(routing.key(), routing.clone());
            }

            Command::DeallocateShard {
                index,
                shard_id,
                node_id,
            } => {
                self.shard_routing
                    .remove(&(index.clone(), *shard_id, node_id.clone()));
            }

            Command::UpdateShard {
                index,
                shard_id,
                node_id,
                state,
                version,
            } => {
                let routing = self
                    .shard_routing
                    .get_mut(&(index.clone(), *shard_id, node_id.clone()))
                    .ok_or_else(|| {
                        ClusterError::NotFound(format!("shard {index}/{shard_id} on {node_id}"))
                    })?;
                routing.state = *state;
                routing.version = *version;
            }
        }

        self.version += 1;
        Ok(())
    }

    fn unassign_node_shards(&mut self, node_id: &str) {
        for routing in self.shard_routing.values_mut() {
            if routing.node_id == node_id {
                routing.state = ShardState::Unassigned;
                routing.version += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NodeRole;
    use quidditch::schema::IndexSchema;

    fn create_index_cmd(name: &str) -> Command {
        Command::CreateIndex {
            name: name.to_string(),
            uuid: format!("uuid-{name}"),
            num_shards: 2,
            num_replicas: 0,
            schema: IndexSchema::default(),
            created_at_ms: 1_700_000_000_000,
        }
    }

    fn node(id: &str) -> NodeMeta {
        NodeMeta {
            node_id: id.to_string(),
            role: NodeRole::Data,
            address: "127.0.0.1".to_string(),
            port: 7311,
            status: NodeStatus::Healthy,
            last_heartbeat_ms: 0,
        }
    }

    fn routing(index: &str, shard: u32, node: &str, primary: bool) -> ShardRouting {
        ShardRouting {
            index: index.to_string(),
            shard_id: shard,
            is_primary: primary,
            node_id: node.to_string(),
            state: ShardState::Initializing,
            version: 1,
        }
    }

    #[test]
    fn test_version_advances_once_per_applied_command() {
        let mut state = ClusterState::new("uuid".into());
        assert_eq!(state.version, 0);
        state.apply(&create_index_cmd("a")).unwrap();
        assert_eq!(state.version, 1);
        state.apply(&Command::RegisterNode { node: node("d1") }).unwrap();
        assert_eq!(state.version, 2);
    }

    #[test]
    fn test_failed_command_leaves_state_untouched() {
        let mut state = ClusterState::new("uuid".into());
        state.apply(&create_index_cmd("a")).unwrap();
        let before = state.clone();

        let err = state.apply(&create_index_cmd("a")).unwrap_err();
        assert!(matches!(err, ClusterError::AlreadyExists(_)));
        assert_eq!(state.version, before.version);

        let err = state
            .apply(&Command::DeleteIndex { name: "ghost".into() })
            .unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
        assert_eq!(state.version, before.version);
    }

    #[test]
    fn test_register_node_is_idempotent() {
        let mut state = ClusterState::new("uuid".into());
        state.apply(&Command::RegisterNode { node: node("d1") }).unwrap();
        let after_first = state.nodes.clone();
        state.apply(&Command::RegisterNode { node: node("d1") }).unwrap();
        assert_eq!(state.nodes.len(), 1);
        assert_eq!(
            state.nodes["d1"].node_id,
            after_first["d1"].node_id
        );
    }

    #[test]
    fn test_delete_index_cascades_routing() {
        let mut state = ClusterState::new("uuid".into());
        state.apply(&create_index_cmd("a")).unwrap();
        state
            .apply(&Command::AllocateShard {
                routing: routing("a", 0, "d1", true),
            })
            .unwrap();
        state
            .apply(&Command::AllocateShard {
                routing: routing("other", 0, "d1", true),
            })
            .unwrap();

        state.apply(&Command::DeleteIndex { name: "a".into() }).unwrap();
        assert!(state.indices.is_empty());
        assert_eq!(state.shard_routing.len(), 1);
        assert!(state.routing_for_index("a").is_empty());
    }

    #[test]
    fn test_offline_node_unassigns_shards() {
        let mut state = ClusterState::new("uuid".into());
        state.apply(&Command::RegisterNode { node: node("d1") }).unwrap();
        state
            .apply(&Command::AllocateShard {
                routing: ShardRouting {
                    state: ShardState::Started,
                    ..routing("a", 0, "d1", true)
                },
            })
            .unwrap();

        state
            .apply(&Command::UpdateNode {
                node_id: "d1".into(),
                status: NodeStatus::Offline,
            })
            .unwrap();

        let entry = state.primary_of("a", 0).unwrap();
        assert_eq!(entry.state, ShardState::Unassigned);
        assert_eq!(entry.version, 2);
    }

    #[test]
    fn test_heartbeat_updates_and_revives() {
        let mut state = ClusterState::new("uuid".into());
        let mut offline = node("d1");
        offline.status = NodeStatus::Offline;
        state.apply(&Command::RegisterNode { node: offline }).unwrap();

        state
            .apply(&Command::Heartbeat {
                node_id: "d1".into(),
                timestamp_ms: 42,
            })
            .unwrap();
        let n = state.node("d1").unwrap();
        assert_eq!(n.last_heartbeat_ms, 42);
        assert_eq!(n.status, NodeStatus::Healthy);

        let err = state
            .apply(&Command::Heartbeat {
                node_id: "ghost".into(),
                timestamp_ms: 42,
            })
            .unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
    }

    #[test]
    fn test_allocate_primary_replaces_old_primary() {
        let mut state = ClusterState::new("uuid".into());
        state
            .apply(&Command::AllocateShard {
                routing: routing("a", 0, "d1", true),
            })
            .unwrap();
        state
            .apply(&Command::AllocateShard {
                routing: routing("a", 0, "d2", true),
            })
            .unwrap();

        let primaries: Vec<_> = state
            .routing_for_shard("a", 0)
            .into_iter()
            .filter(|r| r.is_primary)
            .collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].node_id, "d2");
    }

    #[test]
    fn test_update_shard_transitions() {
        let mut state = ClusterState::new("uuid".into());
        state
            .apply(&Command::AllocateShard {
                routing: routing("a", 0, "d1", true),
            })
            .unwrap();
        state
            .apply(&Command::UpdateShard {
                index: "a".into(),
                shard_id: 0,
                node_id: "d1".into(),
                state: ShardState::Started,
                version: 2,
            })
            .unwrap();
        let entry = state.primary_of("a", 0).unwrap();
        assert_eq!(entry.state, ShardState::Started);
        assert!(entry.is_primary, "transition must preserve primary flag");
        assert_eq!(entry.version, 2);
    }
}
