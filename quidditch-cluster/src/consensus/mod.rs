//! Single-leader log-replicated consensus driving the state machine.
//!
//! A Raft-family implementation: randomized election timeouts, term-gated
//! append-entries, quorum commit, snapshot-based log compaction. The node
//! exposes `apply` (blocking until quorum commit + local apply, or
//! deadline), `is_leader` and `leader_address`; everything else runs on
//! background tasks.

pub mod log;
pub mod storage;
pub mod transport;

pub use log::{EntryPayload, LogEntry, LogIndex, RaftLog, Term};
pub use storage::{LogStore, Snapshot, SnapshotMeta, SnapshotStore, StableState, StableStore};
pub use transport::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftTransport, VoteRequest, VoteResponse,
};

use crate::error::{ClusterError, Result};
use crate::state::{Command, StateMachine};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Consensus tuning. Timeouts follow the usual rule: election timeouts are
/// several heartbeat intervals and randomized to avoid split votes.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's raft endpoint; doubles as its consensus identity.
    pub raft_addr: String,
    /// This node's admin RPC endpoint, advertised in leader hints.
    pub rpc_addr: String,
    /// Peer raft endpoints. Empty bootstraps a single-node cluster.
    pub peers: Vec<String>,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    /// Per-peer RPC deadline.
    pub rpc_timeout: Duration,
    /// Retained log entries before a snapshot is attempted.
    pub snapshot_threshold: u64,
}

impl RaftConfig {
    pub fn new(raft_addr: impl Into<String>, rpc_addr: impl Into<String>, peers: Vec<String>) -> Self {
        Self {
            raft_addr: raft_addr.into(),
            rpc_addr: rpc_addr.into(),
            peers,
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            heartbeat_interval: Duration::from_millis(100),
            rpc_timeout: Duration::from_millis(500),
            snapshot_threshold: 1024,
        }
    }

    fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }
}

struct RaftState {
    role: Role,
    current_term: Term,
    voted_for: Option<String>,
    /// `(raft_addr, rpc_addr)` of the known leader.
    leader: Option<(String, String)>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    next_index: HashMap<String, LogIndex>,
    match_index: HashMap<String, LogIndex>,
    election_deadline: Instant,
    last_heartbeat_sent: Instant,
}

/// Outcome of applying one log entry, kept until its proposer collects it.
type ApplyOutcome = (Term, std::result::Result<u64, ClusterError>);

pub struct ConsensusNode {
    config: RaftConfig,
    machine: Arc<StateMachine>,
    state: Mutex<RaftState>,
    log: Mutex<RaftLog>,
    log_store: Mutex<LogStore>,
    stable: StableStore,
    snapshots: SnapshotStore,
    transport: Arc<dyn RaftTransport>,
    applied_tx: watch::Sender<LogIndex>,
    applied_rx: watch::Receiver<LogIndex>,
    outcomes: Mutex<HashMap<LogIndex, ApplyOutcome>>,
    /// Wakes the ticker for an immediate replication round after a
    /// proposal, instead of waiting out the heartbeat interval.
    replicate_notify: tokio::sync::Notify,
    shutdown: AtomicBool,
}

impl ConsensusNode {
    /// Open the durable stores under `dir`, restore the newest snapshot and
    /// replay the persisted log tail.
    pub fn open(
        dir: &Path,
        config: RaftConfig,
        machine: Arc<StateMachine>,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<Arc<Self>> {
        let stable = StableStore::open(dir)?;
        let snapshots = SnapshotStore::open(dir)?;
        let mut log_store = LogStore::open(dir)?;

        let stable_state = stable.load()?;
        let mut snapshot_index = 0;
        let mut snapshot_term = 0;
        if let Some(snapshot) = snapshots.latest()? {
            machine.restore(&snapshot.data)?;
            snapshot_index = snapshot.meta.last_included_index;
            snapshot_term = snapshot.meta.last_included_term;
        }

        // Entries at or below the snapshot point are already in the
        // restored state.
        let entries: Vec<LogEntry> = log_store
            .load()?
            .into_iter()
            .filter(|e| e.index > snapshot_index)
            .collect();
        log_store.rewrite(&entries)?;
        let log = RaftLog::restore(snapshot_index, snapshot_term, entries);

        let now = Instant::now();
        let election_deadline = now + random_timeout(&config);
        let (applied_tx, applied_rx) = watch::channel(snapshot_index);

        let node = Arc::new(Self {
            state: Mutex::new(RaftState {
                role: Role::Follower,
                current_term: stable_state.current_term,
                voted_for: stable_state.voted_for,
                leader: None,
                commit_index: snapshot_index,
                last_applied: snapshot_index,
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                election_deadline,
                last_heartbeat_sent: now,
            }),
            config,
            machine,
            log: Mutex::new(log),
            log_store: Mutex::new(log_store),
            stable,
            snapshots,
            transport,
            applied_tx,
            applied_rx,
            outcomes: Mutex::new(HashMap::new()),
            replicate_notify: tokio::sync::Notify::new(),
            shutdown: AtomicBool::new(false),
        });

        // Replay whatever was already committed before the restart: with a
        // cold peer view we cannot know the old commit index, so committed
        // entries re-commit through normal replication. Nothing to do here.
        Ok(node)
    }

    pub fn machine(&self) -> &Arc<StateMachine> {
        &self.machine
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().role == Role::Leader
    }

    /// Admin RPC address of the current leader, when known.
    pub fn leader_address(&self) -> Option<String> {
        self.state.lock().leader.as_ref().map(|(_, rpc)| rpc.clone())
    }

    pub fn current_term(&self) -> Term {
        self.state.lock().current_term
    }

    /// Start the background ticker: election timeouts on followers,
    /// heartbeat replication on the leader. Proposals nudge the ticker
    /// through `replicate_notify` for sub-heartbeat commit latency.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let node = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(50));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                let nudged = tokio::select! {
                    _ = tick.tick() => false,
                    _ = node.replicate_notify.notified() => true,
                };
                if node.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let (role, heartbeat_due, election_due) = {
                    let state = node.state.lock();
                    let now = Instant::now();
                    (
                        state.role,
                        now.duration_since(state.last_heartbeat_sent)
                            >= node.config.heartbeat_interval,
                        now >= state.election_deadline,
                    )
                };
                match role {
                    Role::Leader => {
                        if heartbeat_due || nudged {
                            node.state.lock().last_heartbeat_sent = Instant::now();
                            Self::replication_round(&node);
                        }
                    }
                    Role::Follower | Role::Candidate => {
                        if election_due {
                            node.clone().start_election().await;
                        }
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    // ========================================================================
    // Client entry point
    // ========================================================================

    /// Submit a command. Returns the post-apply state version once the
    /// entry is committed by a quorum and applied locally. On `Timeout` the
    /// command's ultimate commitment is undefined; callers retry with
    /// idempotent payloads.
    pub async fn apply(&self, command: Command, deadline: Duration) -> Result<u64> {
        let (index, term) = {
            let state = self.state.lock();
            if state.role != Role::Leader {
                return Err(ClusterError::NotLeader {
                    leader: state.leader.as_ref().map(|(_, rpc)| rpc.clone()),
                });
            }
            let term = state.current_term;
            drop(state);

            let mut log = self.log.lock();
            let index = log.last_index() + 1;
            let entry = LogEntry {
                term,
                index,
                payload: EntryPayload::Command(command),
            };
            self.log_store.lock().append(&entry)?;
            log.append(entry)?;
            (index, term)
        };

        metrics::counter!("consensus_commands_proposed_total").increment(1);
        self.advance_commit();
        self.replicate_notify.notify_one();

        let mut applied = self.applied_rx.clone();
        let waited = tokio::time::timeout(deadline, async {
            while *applied.borrow() < index {
                if applied.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

        if waited.is_err() {
            metrics::counter!("consensus_apply_timeouts_total").increment(1);
            return Err(ClusterError::Timeout(format!(
                "command at log index {index} not committed within deadline"
            )));
        }

        match self.outcomes.lock().remove(&index) {
            Some((applied_term, outcome)) if applied_term == term => {
                outcome
            }
            // The slot was filled by a different leader's entry: our
            // proposal was overwritten.
            _ => Err(ClusterError::NotLeader {
                leader: self.leader_address(),
            }),
        }
    }

    // ========================================================================
    // Elections
    // ========================================================================

    async fn start_election(self: Arc<Self>) {
        let (term, request) = {
            let mut state = self.state.lock();
            state.role = Role::Candidate;
            state.current_term += 1;
            state.voted_for = Some(self.config.raft_addr.clone());
            state.leader = None;
            state.election_deadline = Instant::now() + random_timeout(&self.config);
            let term = state.current_term;
            drop(state);

            self.persist_stable();
            let log = self.log.lock();
            (
                term,
                VoteRequest {
                    term,
                    candidate: self.config.raft_addr.clone(),
                    last_log_index: log.last_index(),
                    last_log_term: log.last_term(),
                },
            )
        };

        tracing::info!(node = %self.config.raft_addr, term, "starting election");

        let mut votes = 1usize; // self
        let quorum = self.config.quorum();
        if votes >= quorum {
            self.become_leader(term);
            return;
        }

        let calls = self.config.peers.iter().map(|peer| {
            let node = Arc::clone(&self);
            let request = request.clone();
            let peer = peer.clone();
            async move {
                tokio::time::timeout(
                    node.config.rpc_timeout,
                    node.transport.request_vote(&peer, request),
                )
                .await
            }
        });

        for outcome in futures::future::join_all(calls).await {
            let Ok(Ok(response)) = outcome else { continue };
            if response.term > term {
                self.step_down(response.term);
                return;
            }
            if response.vote_granted {
                votes += 1;
            }
        }

        if votes >= quorum {
            self.become_leader(term);
        }
    }

    fn become_leader(&self, term: Term) {
        let mut state = self.state.lock();
        if state.role != Role::Candidate || state.current_term != term {
            return;
        }
        tracing::info!(node = %self.config.raft_addr, term, "won election");
        metrics::counter!("consensus_elections_won_total").increment(1);
        state.role = Role::Leader;
        state.leader = Some((self.config.raft_addr.clone(), self.config.rpc_addr.clone()));
        let next = self.log.lock().last_index() + 1;
        state.next_index = self
            .config
            .peers
            .iter()
            .map(|p| (p.clone(), next))
            .collect();
        state.match_index = self.config.peers.iter().map(|p| (p.clone(), 0)).collect();
        state.last_heartbeat_sent = Instant::now();
        drop(state);

        // A no-op at the new term lets the commit rule reach every entry
        // committed under previous leaders.
        {
            let mut log = self.log.lock();
            let entry = LogEntry {
                term,
                index: log.last_index() + 1,
                payload: EntryPayload::Noop,
            };
            if self.log_store.lock().append(&entry).is_ok() {
                let _ = log.append(entry);
            }
        }

        self.advance_commit();
        self.replicate_notify.notify_one();
    }

    fn step_down(&self, term: Term) {
        let mut state = self.state.lock();
        if term > state.current_term {
            state.current_term = term;
            state.voted_for = None;
        }
        if state.role != Role::Follower {
            tracing::info!(node = %self.config.raft_addr, term, "stepping down to follower");
            state.role = Role::Follower;
        }
        state.election_deadline = Instant::now() + random_timeout(&self.config);
        drop(state);
        self.persist_stable();
    }

    /// Vote handler, invoked by the raft RPC surface.
    pub fn handle_request_vote(&self, request: VoteRequest) -> VoteResponse {
        let mut state = self.state.lock();

        if request.term > state.current_term {
            state.current_term = request.term;
            state.role = Role::Follower;
            state.voted_for = None;
            state.leader = None;
        }

        if request.term < state.current_term {
            return VoteResponse {
                term: state.current_term,
                vote_granted: false,
            };
        }

        let already_voted_elsewhere = state
            .voted_for
            .as_ref()
            .map(|v| v != &request.candidate)
            .unwrap_or(false);
        if already_voted_elsewhere {
            return VoteResponse {
                term: state.current_term,
                vote_granted: false,
            };
        }

        let (our_last_index, our_last_term) = {
            let log = self.log.lock();
            (log.last_index(), log.last_term())
        };
        let log_ok = request.last_log_term > our_last_term
            || (request.last_log_term == our_last_term
                && request.last_log_index >= our_last_index);
        if !log_ok {
            return VoteResponse {
                term: state.current_term,
                vote_granted: false,
            };
        }

        state.voted_for = Some(request.candidate.clone());
        state.election_deadline = Instant::now() + random_timeout(&self.config);
        let term = state.current_term;
        drop(state);
        self.persist_stable();

        VoteResponse {
            term,
            vote_granted: true,
        }
    }

    // ========================================================================
    // Replication
    // ========================================================================

    /// Fire one replication round to every peer.
    fn replication_round(node: &Arc<Self>) {
        for peer in node.config.peers.clone() {
            let node = Arc::clone(node);
            tokio::spawn(async move {
                node.replicate_to(&peer).await;
            });
        }
        // Single-node clusters commit on their own.
        if node.config.peers.is_empty() {
            node.advance_commit();
        }
    }

    async fn replicate_to(self: Arc<Self>, peer: &str) {
        enum Payload {
            Entries(AppendEntriesRequest),
            Snapshot(InstallSnapshotRequest),
        }

        let payload = {
            let state = self.state.lock();
            if state.role != Role::Leader {
                return;
            }
            let term = state.current_term;
            let commit = state.commit_index;
            let next = state.next_index.get(peer).copied().unwrap_or(1);
            drop(state);

            let log = self.log.lock();
            if next < log.first_index() {
                // The peer is behind the compaction horizon.
                match self.snapshots.latest() {
                    Ok(Some(snapshot)) => Payload::Snapshot(InstallSnapshotRequest {
                        term,
                        leader: self.config.raft_addr.clone(),
                        leader_rpc_addr: self.config.rpc_addr.clone(),
                        snapshot,
                    }),
                    _ => return,
                }
            } else {
                let prev_log_index = next - 1;
                let Some(prev_log_term) = log.term_at(prev_log_index) else {
                    return;
                };
                Payload::Entries(AppendEntriesRequest {
                    term,
                    leader: self.config.raft_addr.clone(),
                    leader_rpc_addr: self.config.rpc_addr.clone(),
                    prev_log_index,
                    prev_log_term,
                    entries: log.range(next, log.last_index()),
                    leader_commit: commit,
                })
            }
        };

        match payload {
            Payload::Entries(request) => {
                let sent_up_to = request.prev_log_index + request.entries.len() as u64;
                let result = tokio::time::timeout(
                    self.config.rpc_timeout,
                    self.transport.append_entries(peer, request),
                )
                .await;
                let Ok(Ok(response)) = result else { return };

                let mut state = self.state.lock();
                if response.term > state.current_term {
                    drop(state);
                    self.step_down(response.term);
                    return;
                }
                if state.role != Role::Leader {
                    return;
                }
                if response.success {
                    state.match_index.insert(peer.to_string(), sent_up_to);
                    state.next_index.insert(peer.to_string(), sent_up_to + 1);
                    drop(state);
                    self.advance_commit();
                } else {
                    let back_off = response
                        .conflict_index
                        .unwrap_or_else(|| response.match_index.saturating_add(1))
                        .max(1);
                    state.next_index.insert(peer.to_string(), back_off);
                }
            }
            Payload::Snapshot(request) => {
                let snapshot_index = request.snapshot.meta.last_included_index;
                let result = tokio::time::timeout(
                    self.config.rpc_timeout,
                    self.transport.install_snapshot(peer, request),
                )
                .await;
                let Ok(Ok(response)) = result else { return };

                let mut state = self.state.lock();
                if response.term > state.current_term {
                    drop(state);
                    self.step_down(response.term);
                    return;
                }
                state.match_index.insert(peer.to_string(), snapshot_index);
                state
                    .next_index
                    .insert(peer.to_string(), snapshot_index + 1);
            }
        }
    }

    /// Advance the commit index to the highest quorum-replicated entry of
    /// the current term, then apply.
    fn advance_commit(&self) {
        let newly_committed = {
            let mut state = self.state.lock();
            if state.role != Role::Leader {
                return;
            }
            let log = self.log.lock();
            let mut indices: Vec<LogIndex> = state.match_index.values().copied().collect();
            indices.push(log.last_index());
            indices.sort_unstable_by(|a, b| b.cmp(a));
            let quorum_index = indices[self.config.quorum() - 1];

            if quorum_index > state.commit_index
                && log.term_at(quorum_index) == Some(state.current_term)
            {
                state.commit_index = quorum_index;
                true
            } else {
                false
            }
        };
        if newly_committed {
            self.apply_committed();
        }
    }

    /// Apply every committed-but-unapplied entry to the state machine.
    fn apply_committed(&self) {
        let mut applied_to = None;
        loop {
            let entry = {
                let mut state = self.state.lock();
                if state.last_applied >= state.commit_index {
                    break;
                }
                let next = state.last_applied + 1;
                let Some(entry) = self.log.lock().get(next).cloned() else {
                    break;
                };
                state.last_applied = next;
                entry
            };

            let outcome = match &entry.payload {
                EntryPayload::Noop => Ok(self.machine.version()),
                EntryPayload::Command(command) => self.machine.apply(command),
            };
            metrics::counter!("consensus_commands_applied_total").increment(1);
            let mut outcomes = self.outcomes.lock();
            outcomes.insert(entry.index, (entry.term, outcome));
            // Bound the outcome buffer; uncollected results age out.
            if outcomes.len() > 4096 {
                let horizon = entry.index.saturating_sub(4096);
                outcomes.retain(|&i, _| i > horizon);
            }
            applied_to = Some(entry.index);
        }

        if let Some(index) = applied_to {
            let _ = self.applied_tx.send(index);
            self.maybe_snapshot();
        }
    }

    /// Compact the log through a snapshot once it outgrows the threshold.
    fn maybe_snapshot(&self) {
        let last_applied = self.state.lock().last_applied;
        {
            let log = self.log.lock();
            if (log.len() as u64) < self.config.snapshot_threshold {
                return;
            }
        }
        if let Err(e) = self.snapshot_now(last_applied) {
            tracing::warn!(error = %e, "snapshot attempt failed");
        }
    }

    /// Take a snapshot at `index` and compact the log. Also reachable on
    /// demand from the admin surface.
    pub fn snapshot_now(&self, index: LogIndex) -> Result<()> {
        let term = {
            let log = self.log.lock();
            match log.term_at(index) {
                Some(term) => term,
                None => return Ok(()), // already compacted past it
            }
        };
        let data = self.machine.snapshot()?;
        self.snapshots.save(&Snapshot {
            meta: SnapshotMeta {
                last_included_index: index,
                last_included_term: term,
            },
            data,
        })?;
        let mut log = self.log.lock();
        log.compact(index, term);
        self.log_store.lock().rewrite(&log.all())?;
        tracing::info!(index, term, "log compacted into snapshot");
        Ok(())
    }

    /// Append-entries handler, invoked by the raft RPC surface.
    pub fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        {
            let mut state = self.state.lock();
            if request.term < state.current_term {
                return AppendEntriesResponse {
                    term: state.current_term,
                    success: false,
                    match_index: 0,
                    conflict_index: None,
                };
            }

            let term_advanced = request.term > state.current_term;
            if term_advanced {
                state.current_term = request.term;
                state.voted_for = None;
            }
            state.role = Role::Follower;
            state.leader = Some((request.leader.clone(), request.leader_rpc_addr.clone()));
            state.election_deadline = Instant::now() + random_timeout(&self.config);
            drop(state);
            if term_advanced {
                self.persist_stable();
            }
        }

        // Log consistency check.
        let (success, match_index, conflict_index) = {
            let mut log = self.log.lock();
            if request.prev_log_index > log.last_index() {
                (false, 0, Some(log.last_index() + 1))
            } else if request.prev_log_index >= log.snapshot_index()
                && log.term_at(request.prev_log_index) != Some(request.prev_log_term)
            {
                (false, 0, Some(request.prev_log_index.max(1)))
            } else {
                let mut dirty = false;
                for entry in &request.entries {
                    if entry.index <= log.snapshot_index() {
                        continue;
                    }
                    match log.term_at(entry.index) {
                        Some(existing) if existing == entry.term => continue,
                        Some(_) => {
                            log.truncate_from(entry.index);
                            dirty = true;
                        }
                        None => {}
                    }
                    if log.append(entry.clone()).is_err() {
                        break;
                    }
                    if !dirty {
                        if let Err(e) = self.log_store.lock().append(entry) {
                            tracing::error!(error = %e, "failed to persist log entry");
                        }
                    }
                }
                if dirty {
                    if let Err(e) = self.log_store.lock().rewrite(&log.all()) {
                        tracing::error!(error = %e, "failed to rewrite log after conflict");
                    }
                }
                (true, log.last_index(), None)
            }
        };

        if success {
            let should_apply = {
                let mut state = self.state.lock();
                if request.leader_commit > state.commit_index {
                    state.commit_index = request.leader_commit.min(match_index);
                    true
                } else {
                    false
                }
            };
            if should_apply {
                self.apply_committed();
            }
        }

        AppendEntriesResponse {
            term: self.state.lock().current_term,
            success,
            match_index,
            conflict_index,
        }
    }

    /// Install-snapshot handler, invoked by the raft RPC surface.
    pub fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        {
            let mut state = self.state.lock();
            if request.term < state.current_term {
                return Ok(InstallSnapshotResponse {
                    term: state.current_term,
                });
            }
            if request.term > state.current_term {
                state.current_term = request.term;
                state.voted_for = None;
            }
            state.role = Role::Follower;
            state.leader = Some((request.leader.clone(), request.leader_rpc_addr.clone()));
            state.election_deadline = Instant::now() + random_timeout(&self.config);
        }
        self.persist_stable();

        let meta = request.snapshot.meta.clone();
        self.machine.restore(&request.snapshot.data)?;
        self.snapshots.save(&request.snapshot)?;
        {
            let mut log = self.log.lock();
            log.reset_to_snapshot(meta.last_included_index, meta.last_included_term);
            self.log_store.lock().rewrite(&[])?;
        }
        {
            let mut state = self.state.lock();
            state.commit_index = meta.last_included_index;
            state.last_applied = meta.last_included_index;
        }
        let _ = self.applied_tx.send(meta.last_included_index);

        tracing::info!(index = meta.last_included_index, "installed snapshot from leader");
        Ok(InstallSnapshotResponse {
            term: self.state.lock().current_term,
        })
    }

    fn persist_stable(&self) {
        let snapshot = {
            let state = self.state.lock();
            StableState {
                current_term: state.current_term,
                voted_for: state.voted_for.clone(),
            }
        };
        if let Err(e) = self.stable.save(&snapshot) {
            tracing::error!(error = %e, "failed to persist stable state");
        }
    }
}

fn random_timeout(config: &RaftConfig) -> Duration {
    let min = config.election_timeout_min.as_millis() as u64;
    let max = config.election_timeout_max.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
}
