//! Multi-node consensus tests over an in-process transport: election,
//! replication, leader failover and log-backed recovery.

use quidditch_cluster::consensus::{
    AppendEntriesRequest, AppendEntriesResponse, ConsensusNode, InstallSnapshotRequest,
    InstallSnapshotResponse, RaftConfig, RaftTransport, VoteRequest, VoteResponse,
};
use quidditch_cluster::error::{ClusterError, Result};
use quidditch_cluster::state::{Command, NodeMeta, NodeRole, NodeStatus, StateMachine};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Shared in-process wiring between consensus nodes.
#[derive(Default)]
struct MemoryHub {
    nodes: Mutex<HashMap<String, Arc<ConsensusNode>>>,
    down: Mutex<HashSet<String>>,
}

impl MemoryHub {
    fn register(&self, addr: &str, node: Arc<ConsensusNode>) {
        self.nodes.lock().insert(addr.to_string(), node);
    }

    fn partition(&self, addr: &str) {
        self.down.lock().insert(addr.to_string());
    }

    fn lookup(&self, from: &str, to: &str) -> Result<Arc<ConsensusNode>> {
        let down = self.down.lock();
        if down.contains(from) || down.contains(to) {
            return Err(ClusterError::Transport(format!("{from} -> {to} partitioned")));
        }
        drop(down);
        self.nodes
            .lock()
            .get(to)
            .cloned()
            .ok_or_else(|| ClusterError::Transport(format!("unknown peer {to}")))
    }
}

/// One node's view of the hub; outgoing calls fail while the node itself
/// is partitioned.
struct HubTransport {
    hub: Arc<MemoryHub>,
    me: String,
}

#[async_trait::async_trait]
impl RaftTransport for HubTransport {
    async fn request_vote(&self, peer: &str, request: VoteRequest) -> Result<VoteResponse> {
        let node = self.hub.lookup(&self.me, peer)?;
        Ok(node.handle_request_vote(request))
    }

    async fn append_entries(
        &self,
        peer: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let node = self.hub.lookup(&self.me, peer)?;
        Ok(node.handle_append_entries(request))
    }

    async fn install_snapshot(
        &self,
        peer: &str,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let node = self.hub.lookup(&self.me, peer)?;
        node.handle_install_snapshot(request)
    }
}

struct TestRaftCluster {
    _tmp: tempfile::TempDir,
    hub: Arc<MemoryHub>,
    nodes: Vec<(String, Arc<ConsensusNode>, tokio::task::JoinHandle<()>)>,
}

impl TestRaftCluster {
    fn start(size: usize) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let hub = Arc::new(MemoryHub::default());
        let addrs: Vec<String> = (0..size).map(|i| format!("raft-{i}")).collect();

        let mut nodes = Vec::new();
        for (i, addr) in addrs.iter().enumerate() {
            let peers: Vec<String> = addrs.iter().filter(|a| *a != addr).cloned().collect();
            let mut config = RaftConfig::new(addr.clone(), format!("rpc-{i}"), peers);
            config.election_timeout_min = Duration::from_millis(50);
            config.election_timeout_max = Duration::from_millis(150);
            config.heartbeat_interval = Duration::from_millis(20);
            config.rpc_timeout = Duration::from_millis(100);
            config.snapshot_threshold = 16;

            let machine = Arc::new(StateMachine::new("failover-test".into()));
            let transport = Arc::new(HubTransport {
                hub: Arc::clone(&hub),
                me: addr.clone(),
            });
            let node = ConsensusNode::open(&tmp.path().join(addr), config, machine, transport)
                .unwrap();
            hub.register(addr, Arc::clone(&node));
            let handle = Arc::clone(&node).start();
            nodes.push((addr.clone(), node, handle));
        }

        Self {
            _tmp: tmp,
            hub,
            nodes,
        }
    }

    async fn wait_for_leader(&self, exclude: Option<&str>) -> (String, Arc<ConsensusNode>) {
        for _ in 0..300 {
            for (addr, node, _) in &self.nodes {
                if Some(addr.as_str()) == exclude {
                    continue;
                }
                if node.is_leader() {
                    return (addr.clone(), Arc::clone(node));
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no leader elected");
    }

    fn kill(&self, addr: &str) {
        self.hub.partition(addr);
        for (node_addr, node, handle) in &self.nodes {
            if node_addr == addr {
                node.stop();
                handle.abort();
            }
        }
    }
}

fn register_cmd(id: &str) -> Command {
    Command::RegisterNode {
        node: NodeMeta {
            node_id: id.to_string(),
            role: NodeRole::Data,
            address: "127.0.0.1".to_string(),
            port: 7311,
            status: NodeStatus::Healthy,
            last_heartbeat_ms: 0,
        },
    }
}

fn create_index_cmd(name: &str) -> Command {
    Command::CreateIndex {
        name: name.to_string(),
        uuid: format!("uuid-{name}"),
        num_shards: 1,
        num_replicas: 0,
        schema: quidditch::schema::IndexSchema::default(),
        created_at_ms: 1_700_000_000_000,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_three_nodes_elect_exactly_one_leader() {
    let cluster = TestRaftCluster::start(3);
    cluster.wait_for_leader(None).await;
    // Settle, then count leaders.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let leaders = cluster
        .nodes
        .iter()
        .filter(|(_, node, _)| node.is_leader())
        .count();
    assert_eq!(leaders, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_committed_commands_replicate_to_followers() {
    let cluster = TestRaftCluster::start(3);
    let (_, leader) = cluster.wait_for_leader(None).await;

    leader
        .apply(register_cmd("d1"), Duration::from_secs(2))
        .await
        .unwrap();
    leader
        .apply(create_index_cmd("products"), Duration::from_secs(2))
        .await
        .unwrap();

    // Followers converge on the same state.
    for _ in 0..100 {
        if cluster
            .nodes
            .iter()
            .all(|(_, n, _)| n.machine().read().indices.contains_key("products"))
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    for (addr, node, _) in &cluster.nodes {
        let state = node.machine().read();
        assert!(
            state.indices.contains_key("products"),
            "{addr} missing replicated index"
        );
        assert_eq!(state.nodes.len(), 1, "{addr} missing replicated node");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_follower_redirects_with_leader_hint() {
    let cluster = TestRaftCluster::start(3);
    let (leader_addr, _) = cluster.wait_for_leader(None).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (_, follower, _) = cluster
        .nodes
        .iter()
        .find(|(addr, node, _)| addr != &leader_addr && !node.is_leader())
        .expect("a follower exists");

    let err = follower
        .apply(register_cmd("d1"), Duration::from_millis(500))
        .await
        .unwrap_err();
    match err {
        ClusterError::NotLeader { leader } => {
            assert!(leader.is_some(), "follower should know the leader");
        }
        other => panic!("expected NotLeader, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_leader_failover_preserves_committed_index() {
    let cluster = TestRaftCluster::start(3);
    let (leader_addr, leader) = cluster.wait_for_leader(None).await;

    leader
        .apply(create_index_cmd("durable"), Duration::from_secs(2))
        .await
        .unwrap();

    // Kill the leader after the command committed.
    cluster.kill(&leader_addr);

    // A new leader emerges within the election timeout and still sees the
    // committed index.
    let (new_addr, new_leader) = cluster.wait_for_leader(Some(&leader_addr)).await;
    assert_ne!(new_addr, leader_addr);
    for _ in 0..100 {
        if new_leader.machine().read().indices.contains_key("durable") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(new_leader.machine().read().indices.contains_key("durable"));

    // And accepts new writes.
    new_leader
        .apply(create_index_cmd("after-failover"), Duration::from_secs(2))
        .await
        .unwrap();
    assert!(new_leader
        .machine()
        .read()
        .indices
        .contains_key("after-failover"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_register_is_idempotent_across_retries() {
    let cluster = TestRaftCluster::start(3);
    let (_, leader) = cluster.wait_for_leader(None).await;

    // The same payload applied twice, as a caller retrying an unknown
    // outcome would.
    leader
        .apply(register_cmd("d1"), Duration::from_secs(2))
        .await
        .unwrap();
    leader
        .apply(register_cmd("d1"), Duration::from_secs(2))
        .await
        .unwrap();

    let state = leader.machine().read();
    assert_eq!(state.nodes.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lagging_follower_catches_up_from_snapshot() {
    let cluster = TestRaftCluster::start(3);
    let (leader_addr, leader) = cluster.wait_for_leader(None).await;

    // Partition one follower, then push the log past the snapshot
    // threshold so compaction strands it behind the horizon.
    let lagging = cluster
        .nodes
        .iter()
        .map(|(addr, _, _)| addr.clone())
        .find(|addr| addr != &leader_addr)
        .unwrap();
    cluster.hub.partition(&lagging);

    for i in 0..40 {
        leader
            .apply(register_cmd(&format!("d{i}")), Duration::from_secs(2))
            .await
            .unwrap();
    }

    // Heal the partition; the leader must install a snapshot.
    cluster.hub.down.lock().remove(&lagging);
    let follower = cluster
        .nodes
        .iter()
        .find(|(addr, _, _)| addr == &lagging)
        .map(|(_, node, _)| Arc::clone(node))
        .unwrap();
    for _ in 0..300 {
        if follower.machine().read().nodes.len() == 40 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(follower.machine().read().nodes.len(), 40);
}
