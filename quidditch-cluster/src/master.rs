//! Master service: the admin surface of the control plane.
//!
//! Translates admin requests into replicated commands (leader-only),
//! drives shard provisioning on data nodes, sweeps stale heartbeats and
//! settles relocations. The master never mutates shard state locally;
//! every transition goes through the consensus log.

use crate::allocator::{self, AllocationDecision, AllocationPlan, MoveDecision};
use crate::client::DataClientPool;
use crate::consensus::ConsensusNode;
use crate::error::{ClusterError, Result};
use crate::service::{ClusterStateView, CreateIndexRequest, StateProjection};
use crate::state::{
    ClusterState, Command, IndexMeta, IndexState, NodeMeta, NodeStatus, ShardRouting, ShardState,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tarpc::context;

/// Backoff for CreateShard retries: 1 s doubling to a 30 s cap.
const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(30);

/// How long one watch long-poll parks before answering with the current
/// state. Kept under the RPC layer's default request deadline so a parked
/// watch resolves instead of being cancelled.
const WATCH_POLL_DEADLINE: Duration = Duration::from_secs(8);

#[derive(Debug, Clone)]
struct RetryState {
    attempts: u32,
    next_at: Instant,
}

/// Key of an in-flight relocation: `(index, shard_id, from_node)` mapped
/// to the target node.
type RelocationIntent = HashMap<(String, u32, String), String>;

pub struct MasterService {
    consensus: Arc<ConsensusNode>,
    data_pool: Arc<DataClientPool>,
    heartbeat_timeout: Duration,
    apply_timeout: Duration,
    rpc_timeout: Duration,
    retries: Mutex<HashMap<(String, u32, String), RetryState>>,
    relocations: Mutex<RelocationIntent>,
    shutdown: AtomicBool,
}

impl MasterService {
    pub fn new(consensus: Arc<ConsensusNode>, heartbeat_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            consensus,
            data_pool: Arc::new(DataClientPool::new()),
            heartbeat_timeout,
            apply_timeout: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(5),
            retries: Mutex::new(HashMap::new()),
            relocations: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn consensus(&self) -> &Arc<ConsensusNode> {
        &self.consensus
    }

    fn state(&self) -> ClusterState {
        self.consensus.machine().read()
    }

    async fn apply(&self, command: Command) -> Result<u64> {
        self.consensus.apply(command, self.apply_timeout).await
    }

    // ========================================================================
    // Admin operations
    // ========================================================================

    pub fn cluster_state(&self, projection: StateProjection) -> ClusterStateView {
        project(self.state(), projection)
    }

    /// Long-poll for a state newer than `since`; answers with the current
    /// state at the poll deadline either way.
    pub async fn watch_cluster_state(&self, since: u64) -> ClusterStateView {
        let deadline = Instant::now() + WATCH_POLL_DEADLINE;
        loop {
            let state = self.state();
            if state.version > since || Instant::now() >= deadline {
                return project(state, StateProjection::default());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub async fn create_index(&self, request: CreateIndexRequest) -> Result<u64> {
        if request.name.is_empty() {
            return Err(ClusterError::BadRequest("index name is empty".to_string()));
        }
        if request.num_shards == 0 {
            return Err(ClusterError::BadRequest(
                "num_shards must be at least 1".to_string(),
            ));
        }
        request
            .schema
            .validate()
            .map_err(|e| ClusterError::BadRequest(e.to_string()))?;

        self.apply(Command::CreateIndex {
            name: request.name.clone(),
            uuid: uuid::Uuid::new_v4().to_string(),
            num_shards: request.num_shards,
            num_replicas: request.num_replicas,
            schema: request.schema.clone(),
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        })
        .await?;

        let plan = self.allocate_index(&request.name).await?;
        for decision in &plan.decisions {
            self.provision(decision).await;
        }

        let version = self
            .apply(Command::UpdateIndex {
                name: request.name.clone(),
                num_replicas: None,
                state: Some(IndexState::Open),
            })
            .await?;

        tracing::info!(index = %request.name, shards = request.num_shards, "index created");
        Ok(version)
    }

    pub async fn delete_index(&self, name: String) -> Result<u64> {
        let state = self.state();
        let routing: Vec<ShardRouting> = state
            .routing_for_index(&name)
            .into_iter()
            .cloned()
            .collect();
        let version = self.apply(Command::DeleteIndex { name: name.clone() }).await?;

        // Best-effort data-plane cleanup; the commitment is already
        // replicated, so failures only leave orphan directories.
        for entry in routing {
            if let Some(node) = state.node(&entry.node_id) {
                let addr = node.rpc_addr();
                if let Ok(client) = self.data_pool.get(&addr).await {
                    let _ = tokio::time::timeout(
                        self.rpc_timeout,
                        client.remove_shard(
                            context::current(),
                            entry.index.clone(),
                            entry.shard_id,
                        ),
                    )
                    .await;
                }
            }
        }
        tracing::info!(index = %name, "index deleted");
        Ok(version)
    }

    pub async fn update_index_settings(
        &self,
        name: String,
        num_replicas: Option<u32>,
    ) -> Result<u64> {
        let version = self
            .apply(Command::UpdateIndex {
                name: name.clone(),
                num_replicas,
                state: None,
            })
            .await?;
        Ok(version)
    }

    pub fn index_metadata(&self, name: &str) -> Result<IndexMeta> {
        self.state()
            .index(name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("index {name}")))
    }

    /// Run the allocator for an index and persist each decision.
    pub async fn allocate_index(&self, index: &str) -> Result<AllocationPlan> {
        let state = self.state();
        let meta = state
            .index(index)
            .ok_or_else(|| ClusterError::NotFound(format!("index {index}")))?;
        let plan = allocator::allocate(&state, index, meta.num_shards, meta.num_replicas)?;

        for decision in &plan.decisions {
            self.apply(Command::AllocateShard {
                routing: ShardRouting {
                    index: decision.index.clone(),
                    shard_id: decision.shard_id,
                    is_primary: decision.is_primary,
                    node_id: decision.node_id.clone(),
                    state: ShardState::Initializing,
                    version: 1,
                },
            })
            .await?;
        }
        for diagnostic in &plan.diagnostics {
            tracing::warn!(
                index = %diagnostic.index,
                shard = diagnostic.shard_id,
                replica = diagnostic.replica,
                reason = %diagnostic.reason,
                "under-replicated"
            );
        }
        Ok(plan)
    }

    pub async fn rebalance(&self) -> Result<Vec<MoveDecision>> {
        let state = self.state();
        let moves = allocator::rebalance(&state)?;

        for decision in &moves {
            self.apply(Command::UpdateShard {
                index: decision.index.clone(),
                shard_id: decision.shard_id,
                node_id: decision.from.clone(),
                state: ShardState::Relocating,
                version: routing_version(&state, decision) + 1,
            })
            .await?;
            // The incoming copy starts as a replica; it is promoted when
            // the move settles, so a relocating primary keeps serving.
            self.apply(Command::AllocateShard {
                routing: ShardRouting {
                    index: decision.index.clone(),
                    shard_id: decision.shard_id,
                    is_primary: false,
                    node_id: decision.to.clone(),
                    state: ShardState::Initializing,
                    version: 1,
                },
            })
            .await?;
            self.relocations.lock().insert(
                (
                    decision.index.clone(),
                    decision.shard_id,
                    decision.from.clone(),
                ),
                decision.to.clone(),
            );
        }
        tracing::info!(moves = moves.len(), "rebalance planned");
        Ok(moves)
    }

    pub async fn register_node(&self, mut node: NodeMeta) -> Result<u64> {
        node.last_heartbeat_ms = chrono::Utc::now().timestamp_millis();
        node.status = NodeStatus::Healthy;
        let version = self.apply(Command::RegisterNode { node }).await?;
        Ok(version)
    }

    pub async fn unregister_node(&self, node_id: String) -> Result<u64> {
        self.apply(Command::UnregisterNode { node_id }).await
    }

    pub async fn heartbeat(&self, node_id: String) -> Result<u64> {
        self.apply(Command::Heartbeat {
            node_id,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        })
        .await
    }

    // ========================================================================
    // Background work
    // ========================================================================

    /// Start the sweep/retry/settle loop.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let master = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if master.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                if !master.consensus.is_leader() {
                    continue;
                }
                master.sweep_heartbeats().await;
                master.retry_initializing().await;
                master.settle_relocations().await;
            }
        })
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Mark nodes whose heartbeat is stale as Offline, through the log so
    /// every replica agrees.
    async fn sweep_heartbeats(&self) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let timeout_ms = self.heartbeat_timeout.as_millis() as i64;
        let stale: Vec<String> = self
            .state()
            .nodes
            .values()
            .filter(|n| {
                n.status != NodeStatus::Offline && now_ms - n.last_heartbeat_ms > timeout_ms
            })
            .map(|n| n.node_id.clone())
            .collect();

        for node_id in stale {
            tracing::warn!(node = %node_id, "heartbeat stale, marking offline");
            if let Err(e) = self
                .apply(Command::UpdateNode {
                    node_id: node_id.clone(),
                    status: NodeStatus::Offline,
                })
                .await
            {
                tracing::warn!(node = %node_id, error = %e, "offline mark failed");
            }
        }
    }

    /// Re-drive CreateShard for copies stuck in Initializing, with capped
    /// exponential backoff. A shard is never left in a non-terminal state
    /// silently.
    async fn retry_initializing(&self) {
        let state = self.state();
        let pending: Vec<ShardRouting> = state
            .shard_routing
            .values()
            .filter(|r| r.state == ShardState::Initializing)
            .cloned()
            .collect();

        for routing in pending {
            let key = (
                routing.index.clone(),
                routing.shard_id,
                routing.node_id.clone(),
            );
            let due = {
                let retries = self.retries.lock();
                retries.get(&key).map(|r| r.next_at <= Instant::now()).unwrap_or(true)
            };
            if !due {
                continue;
            }
            self.provision(&AllocationDecision {
                index: routing.index.clone(),
                shard_id: routing.shard_id,
                is_primary: routing.is_primary,
                node_id: routing.node_id.clone(),
            })
            .await;
        }
    }

    /// Issue CreateShard to the hosting node and, on acknowledgement, move
    /// the copy to Started (preserving its primary flag).
    async fn provision(&self, decision: &AllocationDecision) {
        let retry_key = (
            decision.index.clone(),
            decision.shard_id,
            decision.node_id.clone(),
        );

        let outcome = self.try_provision(decision).await;
        match outcome {
            Ok(()) => {
                self.retries.lock().remove(&retry_key);
            }
            Err(e) => {
                let mut retries = self.retries.lock();
                let entry = retries.entry(retry_key).or_insert(RetryState {
                    attempts: 0,
                    next_at: Instant::now(),
                });
                entry.attempts += 1;
                let backoff = RETRY_BASE
                    .saturating_mul(2u32.pow((entry.attempts - 1).min(5)))
                    .min(RETRY_CAP);
                entry.next_at = Instant::now() + backoff;
                tracing::warn!(
                    index = %decision.index,
                    shard = decision.shard_id,
                    node = %decision.node_id,
                    attempts = entry.attempts,
                    error = %e,
                    "shard provisioning failed, will retry"
                );
            }
        }
    }

    async fn try_provision(&self, decision: &AllocationDecision) -> Result<()> {
        let state = self.state();
        let meta = state
            .index(&decision.index)
            .ok_or_else(|| ClusterError::NotFound(format!("index {}", decision.index)))?;
        let node = state
            .node(&decision.node_id)
            .ok_or_else(|| ClusterError::NotFound(format!("node {}", decision.node_id)))?;
        let routing = state
            .shard_routing
            .get(&(
                decision.index.clone(),
                decision.shard_id,
                decision.node_id.clone(),
            ))
            .ok_or_else(|| {
                ClusterError::NotFound(format!(
                    "routing {}/{} on {}",
                    decision.index, decision.shard_id, decision.node_id
                ))
            })?;

        let addr = node.rpc_addr();
        let client = self.data_pool.get(&addr).await?;
        let created = tokio::time::timeout(
            self.rpc_timeout,
            client.create_shard(
                context::current(),
                decision.index.clone(),
                decision.shard_id,
                meta.schema.clone(),
            ),
        )
        .await;

        match created {
            Ok(Ok(Ok(()))) => {
                self.apply(Command::UpdateShard {
                    index: decision.index.clone(),
                    shard_id: decision.shard_id,
                    node_id: decision.node_id.clone(),
                    state: ShardState::Started,
                    version: routing.version + 1,
                })
                .await?;
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(e)) => {
                self.data_pool.evict(&addr);
                Err(crate::client::rpc_error(e))
            }
            Err(_) => {
                self.data_pool.evict(&addr);
                Err(ClusterError::Timeout(format!("create_shard on {addr}")))
            }
        }
    }

    /// Complete relocations whose incoming copy has started: promote the
    /// copy if the source was a primary, then deallocate the source.
    async fn settle_relocations(&self) {
        let intents: Vec<((String, u32, String), String)> = self
            .relocations
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if intents.is_empty() {
            return;
        }

        let state = self.state();
        for ((index, shard_id, from), to) in intents {
            let target = state
                .shard_routing
                .get(&(index.clone(), shard_id, to.clone()));
            let source = state
                .shard_routing
                .get(&(index.clone(), shard_id, from.clone()));

            let (Some(target), Some(source)) = (target, source) else {
                self.relocations.lock().remove(&(index, shard_id, from));
                continue;
            };
            if target.state != ShardState::Started {
                continue;
            }

            let was_primary = source.is_primary;
            let settled = async {
                self.apply(Command::DeallocateShard {
                    index: index.clone(),
                    shard_id,
                    node_id: from.clone(),
                })
                .await?;
                if was_primary {
                    self.apply(Command::AllocateShard {
                        routing: ShardRouting {
                            index: index.clone(),
                            shard_id,
                            is_primary: true,
                            node_id: to.clone(),
                            state: ShardState::Started,
                            version: target.version + 1,
                        },
                    })
                    .await?;
                }
                Ok::<_, ClusterError>(())
            }
            .await;

            match settled {
                Ok(()) => {
                    tracing::info!(index = %index, shard = shard_id, from = %from, to = %to, "relocation settled");
                    self.relocations.lock().remove(&(index, shard_id, from));
                }
                Err(e) => {
                    tracing::warn!(index = %index, shard = shard_id, error = %e, "relocation settle failed");
                }
            }
        }
    }
}

fn routing_version(state: &ClusterState, decision: &MoveDecision) -> u64 {
    state
        .shard_routing
        .get(&(
            decision.index.clone(),
            decision.shard_id,
            decision.from.clone(),
        ))
        .map(|r| r.version)
        .unwrap_or(1)
}

/// Project the full state into the requested view sections.
pub fn project(state: ClusterState, projection: StateProjection) -> ClusterStateView {
    ClusterStateView {
        version: state.version,
        cluster_uuid: state.cluster_uuid.clone(),
        indices: projection.indices.then_some(state.indices),
        nodes: projection.nodes.then_some(state.nodes),
        shard_routing: projection
            .routing
            .then(|| state.shard_routing.into_values().collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_projection_drops_sections() {
        let mut state = ClusterState::new("uuid".into());
        state.version = 9;
        let view = project(
            state,
            StateProjection {
                indices: true,
                nodes: false,
                routing: false,
            },
        );
        assert_eq!(view.version, 9);
        assert!(view.indices.is_some());
        assert!(view.nodes.is_none());
        assert!(view.shard_routing.is_none());
    }
}
