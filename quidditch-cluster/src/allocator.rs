//! Shard placement and rebalancing.
//!
//! Pure functions over a cluster-state value: the caller (the master)
//! turns the returned decisions into replicated commands. Ties always
//! break on lexicographic node id, so every replica computes the same
//! placement from the same state.

use crate::error::{ClusterError, Result};
use crate::state::{ClusterState, ShardState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// One placement decision for a shard copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationDecision {
    pub index: String,
    pub shard_id: u32,
    pub is_primary: bool,
    pub node_id: String,
}

/// A copy that could not be placed; under-replication is data, not error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationDiagnostic {
    pub index: String,
    pub shard_id: u32,
    pub replica: u32,
    pub reason: String,
}

/// Output of one allocation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub decisions: Vec<AllocationDecision>,
    pub diagnostics: Vec<AllocationDiagnostic>,
}

/// One rebalance move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveDecision {
    pub index: String,
    pub shard_id: u32,
    pub is_primary: bool,
    pub from: String,
    pub to: String,
}

/// Place all primaries and replicas of one index.
///
/// Primaries go to the node with the lowest cluster-wide shard count;
/// replica copies additionally exclude every node already holding any copy
/// of the same shard. Fails only when no healthy data node exists.
pub fn allocate(
    state: &ClusterState,
    index: &str,
    num_shards: u32,
    num_replicas: u32,
) -> Result<AllocationPlan> {
    let data_nodes: Vec<String> = state
        .healthy_data_nodes()
        .iter()
        .map(|n| n.node_id.clone())
        .collect();
    if data_nodes.is_empty() {
        return Err(ClusterError::Unavailable(
            "no healthy data nodes for allocation".to_string(),
        ));
    }

    // Cluster-wide counts, including placements decided in this pass.
    let mut counts: BTreeMap<String, usize> = state.shard_counts_by_node();
    for node in &data_nodes {
        counts.entry(node.clone()).or_insert(0);
    }

    let mut plan = AllocationPlan::default();
    // Nodes holding any copy of shard s, keyed by shard id.
    let mut holders: BTreeMap<u32, HashSet<String>> = BTreeMap::new();

    for shard_id in 0..num_shards {
        let node = least_loaded(&counts, &data_nodes, None)
            .expect("data_nodes is non-empty");
        *counts.get_mut(&node).unwrap() += 1;
        holders.entry(shard_id).or_default().insert(node.clone());
        plan.decisions.push(AllocationDecision {
            index: index.to_string(),
            shard_id,
            is_primary: true,
            node_id: node,
        });
    }

    for replica in 1..=num_replicas {
        for shard_id in 0..num_shards {
            let exclude = holders.entry(shard_id).or_default();
            match least_loaded(&counts, &data_nodes, Some(exclude)) {
                Some(node) => {
                    *counts.get_mut(&node).unwrap() += 1;
                    exclude.insert(node.clone());
                    plan.decisions.push(AllocationDecision {
                        index: index.to_string(),
                        shard_id,
                        is_primary: false,
                        node_id: node,
                    });
                }
                None => {
                    tracing::warn!(
                        index,
                        shard_id,
                        replica,
                        "not enough distinct nodes for replica copy"
                    );
                    plan.diagnostics.push(AllocationDiagnostic {
                        index: index.to_string(),
                        shard_id,
                        replica,
                        reason: format!(
                            "no node without a copy of shard {shard_id} available"
                        ),
                    });
                }
            }
        }
    }

    Ok(plan)
}

/// The eligible node with the lowest count; ties break on node id.
fn least_loaded(
    counts: &BTreeMap<String, usize>,
    eligible: &[String],
    exclude: Option<&HashSet<String>>,
) -> Option<String> {
    eligible
        .iter()
        .filter(|n| exclude.is_none_or(|ex| !ex.contains(*n)))
        .min_by_key(|n| (counts.get(*n).copied().unwrap_or(0), (*n).clone()))
        .cloned()
}

/// Compute rebalance moves until no node sits above `avg + 1` while
/// another sits below `avg - 1`. Replicas move before primaries, and
/// copies already relocating are never preempted.
pub fn rebalance(state: &ClusterState) -> Result<Vec<MoveDecision>> {
    let data_nodes: Vec<String> = state
        .healthy_data_nodes()
        .iter()
        .map(|n| n.node_id.clone())
        .collect();
    if data_nodes.is_empty() {
        return Err(ClusterError::Unavailable(
            "no healthy data nodes for rebalance".to_string(),
        ));
    }

    let mut counts: BTreeMap<String, usize> = data_nodes
        .iter()
        .map(|n| (n.clone(), 0))
        .collect();
    // Copy ownership per node, replicas ordered before primaries so the
    // cheaper move is preferred.
    let mut owned: BTreeMap<String, Vec<(String, u32, bool)>> = BTreeMap::new();
    // Nodes holding any copy of a given shard, to keep copies distinct.
    let mut holders: BTreeMap<(String, u32), HashSet<String>> = BTreeMap::new();

    for routing in state.shard_routing.values() {
        if !counts.contains_key(&routing.node_id) {
            continue;
        }
        holders
            .entry((routing.index.clone(), routing.shard_id))
            .or_default()
            .insert(routing.node_id.clone());
        *counts.get_mut(&routing.node_id).unwrap() += 1;
        if routing.state == ShardState::Relocating {
            continue;
        }
        owned.entry(routing.node_id.clone()).or_default().push((
            routing.index.clone(),
            routing.shard_id,
            routing.is_primary,
        ));
    }
    for copies in owned.values_mut() {
        copies.sort_by_key(|(index, shard, primary)| (*primary, index.clone(), *shard));
    }

    let total: usize = counts.values().sum();
    let avg = total as f64 / counts.len() as f64;

    let mut moves = Vec::new();
    loop {
        let over = counts
            .iter()
            .filter(|(_, &c)| (c as f64) > avg + 1.0)
            .max_by_key(|(n, &c)| (c, std::cmp::Reverse((*n).clone())))
            .map(|(n, _)| n.clone());
        let under = counts
            .iter()
            .filter(|(_, &c)| (c as f64) < avg - 1.0)
            .min_by_key(|(n, &c)| (c, (*n).clone()))
            .map(|(n, _)| n.clone());

        let (Some(from), Some(to)) = (over, under) else {
            break;
        };

        // Pick the first movable copy whose shard has no copy on the
        // target yet.
        let candidates = owned.entry(from.clone()).or_default();
        let position = candidates.iter().position(|(index, shard, _)| {
            holders
                .get(&(index.clone(), *shard))
                .is_none_or(|h| !h.contains(&to))
        });
        let Some(position) = position else {
            // Every copy on the overloaded node collides on the target.
            break;
        };
        let (index, shard_id, is_primary) = candidates.remove(position);

        *counts.get_mut(&from).unwrap() -= 1;
        *counts.get_mut(&to).unwrap() += 1;
        let holder_set = holders.entry((index.clone(), shard_id)).or_default();
        holder_set.remove(&from);
        holder_set.insert(to.clone());
        owned
            .entry(to.clone())
            .or_default()
            .push((index.clone(), shard_id, is_primary));

        moves.push(MoveDecision {
            index,
            shard_id,
            is_primary,
            from,
            to,
        });
    }

    Ok(moves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Command, NodeMeta, NodeRole, NodeStatus, ShardRouting};

    fn state_with_nodes(ids: &[&str]) -> ClusterState {
        let mut state = ClusterState::new("uuid".into());
        for id in ids {
            state
                .apply(&Command::RegisterNode {
                    node: NodeMeta {
                        node_id: id.to_string(),
                        role: NodeRole::Data,
                        address: "127.0.0.1".to_string(),
                        port: 7311,
                        status: NodeStatus::Healthy,
                        last_heartbeat_ms: 0,
                    },
                })
                .unwrap();
        }
        state
    }

    fn routed(state: &mut ClusterState, index: &str, shard: u32, node: &str, primary: bool) {
        state
            .apply(&Command::AllocateShard {
                routing: ShardRouting {
                    index: index.to_string(),
                    shard_id: shard,
                    is_primary: primary,
                    node_id: node.to_string(),
                    state: ShardState::Started,
                    version: 1,
                },
            })
            .unwrap();
    }

    #[test]
    fn test_single_node_takes_all_primaries() {
        let state = state_with_nodes(&["d1"]);
        let plan = allocate(&state, "products", 3, 0).unwrap();
        assert_eq!(plan.decisions.len(), 3);
        assert!(plan.diagnostics.is_empty());
        assert!(plan
            .decisions
            .iter()
            .all(|d| d.is_primary && d.node_id == "d1"));
    }

    #[test]
    fn test_replicas_on_distinct_nodes_balanced() {
        let state = state_with_nodes(&["d1", "d2", "d3"]);
        let plan = allocate(&state, "products", 2, 1).unwrap();
        assert_eq!(plan.decisions.len(), 4);
        assert!(plan.diagnostics.is_empty());

        // Each shard's copies land on distinct nodes.
        for shard in 0..2u32 {
            let nodes: HashSet<&str> = plan
                .decisions
                .iter()
                .filter(|d| d.shard_id == shard)
                .map(|d| d.node_id.as_str())
                .collect();
            assert_eq!(nodes.len(), 2);
        }

        // Per-node load stays within one copy of each other.
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for decision in &plan.decisions {
            *counts.entry(decision.node_id.as_str()).or_insert(0) += 1;
        }
        let min = counts.values().min().unwrap();
        let max = counts.values().max().unwrap();
        assert!(max - min <= 1);
    }

    #[test]
    fn test_under_replication_is_diagnostic_not_error() {
        let state = state_with_nodes(&["d1"]);
        let plan = allocate(&state, "products", 2, 1).unwrap();
        assert_eq!(plan.decisions.len(), 2, "primaries still placed");
        assert_eq!(plan.diagnostics.len(), 2, "one diagnostic per replica");
        assert_eq!(plan.diagnostics[0].replica, 1);
    }

    #[test]
    fn test_no_data_nodes_is_error() {
        let state = ClusterState::new("uuid".into());
        assert!(matches!(
            allocate(&state, "products", 1, 0),
            Err(ClusterError::Unavailable(_))
        ));
    }

    #[test]
    fn test_allocation_is_deterministic() {
        let state = state_with_nodes(&["d3", "d1", "d2"]);
        let a = allocate(&state, "products", 3, 1).unwrap();
        let b = allocate(&state, "products", 3, 1).unwrap();
        assert_eq!(a, b);
        // First primary lands on the lexicographically smallest of the
        // equally empty nodes.
        assert_eq!(a.decisions[0].node_id, "d1");
    }

    #[test]
    fn test_allocation_counts_existing_load() {
        let mut state = state_with_nodes(&["d1", "d2"]);
        // d1 already carries shards from another index.
        routed(&mut state, "old", 0, "d1", true);
        routed(&mut state, "old", 1, "d1", true);

        let plan = allocate(&state, "new", 2, 0).unwrap();
        assert!(plan.decisions.iter().all(|d| d.node_id == "d2"));
    }

    #[test]
    fn test_rebalance_moves_from_hot_to_cold() {
        let mut state = state_with_nodes(&["d1", "d2"]);
        for shard in 0..4 {
            routed(&mut state, "idx", shard, "d1", true);
        }

        let moves = rebalance(&state).unwrap();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].from, "d1");
        assert_eq!(moves[0].to, "d2");
    }

    #[test]
    fn test_rebalance_prefers_replicas() {
        let mut state = state_with_nodes(&["d1", "d2", "d3"]);
        routed(&mut state, "idx", 0, "d1", true);
        routed(&mut state, "idx", 1, "d1", true);
        routed(&mut state, "idx", 2, "d1", false);
        routed(&mut state, "idx", 3, "d1", true);
        routed(&mut state, "idx", 0, "d2", false);

        let moves = rebalance(&state).unwrap();
        assert!(!moves.is_empty());
        assert!(!moves[0].is_primary, "replica should move first");
    }

    #[test]
    fn test_rebalance_balanced_cluster_is_noop() {
        let mut state = state_with_nodes(&["d1", "d2"]);
        routed(&mut state, "idx", 0, "d1", true);
        routed(&mut state, "idx", 1, "d2", true);
        assert!(rebalance(&state).unwrap().is_empty());
    }

    #[test]
    fn test_rebalance_skips_relocating_copies() {
        let mut state = state_with_nodes(&["d1", "d2"]);
        for shard in 0..4 {
            routed(&mut state, "idx", shard, "d1", true);
        }
        // Mark every copy on d1 as already moving.
        let keys: Vec<_> = state.shard_routing.keys().cloned().collect();
        for (index, shard_id, node_id) in keys {
            state
                .apply(&Command::UpdateShard {
                    index,
                    shard_id,
                    node_id,
                    state: ShardState::Relocating,
                    version: 2,
                })
                .unwrap();
        }
        assert!(rebalance(&state).unwrap().is_empty());
    }
}
