//! Query coordination: scatter to the shards that must answer, gather
//! with per-sub-request deadlines, merge into one ranked, paginated
//! response.
//!
//! A failed sub-request lands in `shard_failures` instead of failing the
//! query; only a complete wipe-out promotes to Unavailable. Aggregation
//! partials merge exactly because every shard reports mergeable state, not
//! finalized values.

use crate::client::DataClientPool;
use crate::error::{ClusterError, Result};
use crate::router;
use crate::service::{shard_key, ShardSearchReply, ShardSearchRequest};
use crate::state::{ClusterState, ShardState, StateMachine};
use quidditch::aggregations::AggPartial;
use quidditch::query::QueryNode;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tarpc::context;

/// Ceiling on per-shard over-fetch, whatever the page size.
const MAX_OVERFETCH: usize = 10_000;

/// Where the coordinator reads routing from. Colocated coordinators read
/// the local replica; standalone ones poll a master.
pub trait StateView: Send + Sync + 'static {
    fn cluster_state(&self) -> ClusterState;
}

impl StateView for Arc<StateMachine> {
    fn cluster_state(&self) -> ClusterState {
        self.read()
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub doc_id: String,
    pub score: f32,
    pub shard_id: u32,
    pub fields: Value,
}

#[derive(Debug, Clone)]
pub struct ShardFailure {
    pub shard_id: u32,
    pub node_id: Option<String>,
    pub reason: String,
    pub timed_out: bool,
}

#[derive(Debug)]
pub struct SearchResults {
    pub total_hits: usize,
    pub max_score: f32,
    pub hits: Vec<SearchHit>,
    pub aggregations: BTreeMap<String, Value>,
    pub shard_failures: Vec<ShardFailure>,
    pub timed_out: bool,
}

pub struct QueryCoordinator {
    view: Arc<dyn StateView>,
    pool: Arc<DataClientPool>,
    sub_request_timeout: Duration,
}

impl QueryCoordinator {
    pub fn new(view: Arc<dyn StateView>) -> Self {
        Self {
            view,
            pool: Arc::new(DataClientPool::new()),
            sub_request_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.sub_request_timeout = timeout;
        self
    }

    // ========================================================================
    // Query path
    // ========================================================================

    #[tracing::instrument(name = "coordinate_search", skip_all, fields(index))]
    pub async fn search(
        &self,
        index: &str,
        query: Value,
        filter: Option<Vec<u8>>,
        from: usize,
        size: usize,
        aggs: Option<Value>,
    ) -> Result<SearchResults> {
        // Validate before fanning out; a malformed tree fails the whole
        // request here, not on every shard.
        let parsed = QueryNode::parse(&query).map_err(ClusterError::from)?;
        if let Some(aggs) = &aggs {
            quidditch::aggregations::AggSpec::parse_map(aggs).map_err(ClusterError::from)?;
        }

        let state = self.view.cluster_state();
        let meta = state
            .index(index)
            .ok_or_else(|| ClusterError::NotFound(format!("index {index}")))?;

        // An exact id predicate pins the query to one shard.
        let shard_ids: Vec<u32> = match parsed.exact_id_predicate() {
            Some(doc_id) => vec![router::shard_of(doc_id, meta.num_shards)],
            None => (0..meta.num_shards).collect(),
        };

        let mut targets: Vec<(u32, String, String)> = Vec::new();
        let mut failures: Vec<ShardFailure> = Vec::new();
        for &shard_id in &shard_ids {
            match serving_copy(&state, index, shard_id) {
                Some((node_id, addr)) => targets.push((shard_id, node_id, addr)),
                None => failures.push(ShardFailure {
                    shard_id,
                    node_id: None,
                    reason: "no started copy on a reachable node".to_string(),
                    timed_out: false,
                }),
            }
        }
        if targets.is_empty() {
            return Err(ClusterError::Unavailable(format!(
                "no reachable shards for index {index}"
            )));
        }

        // Over-fetch so global ranking survives the merge.
        let per_shard = ((from + size) * shard_ids.len())
            .clamp(from + size, MAX_OVERFETCH)
            .max(1);

        let calls = targets.into_iter().map(|(shard_id, node_id, addr)| {
            let request = ShardSearchRequest {
                shard_key: shard_key(index, shard_id),
                query: query.clone(),
                filter: filter.clone(),
                from: 0,
                size: per_shard,
                aggs: aggs.clone(),
            };
            let pool = Arc::clone(&self.pool);
            let timeout = self.sub_request_timeout;
            async move {
                let outcome = Self::search_one(pool, &addr, request, timeout).await;
                (shard_id, node_id, addr, outcome)
            }
        });

        let mut replies: Vec<(u32, ShardSearchReply)> = Vec::new();
        for (shard_id, node_id, addr, outcome) in futures::future::join_all(calls).await {
            match outcome {
                Ok(reply) => replies.push((shard_id, reply)),
                Err(e) => {
                    let timed_out = matches!(e, ClusterError::Timeout(_));
                    if timed_out {
                        self.pool.evict(&addr);
                    }
                    metrics::counter!("coordinator_shard_failures_total").increment(1);
                    failures.push(ShardFailure {
                        shard_id,
                        node_id: Some(node_id),
                        reason: e.to_string(),
                        timed_out,
                    });
                }
            }
        }

        if replies.is_empty() {
            return Err(ClusterError::Unavailable(format!(
                "all {} shard sub-requests failed for index {index}",
                failures.len()
            )));
        }

        Ok(merge(replies, failures, from, size))
    }

    async fn search_one(
        pool: Arc<DataClientPool>,
        addr: &str,
        request: ShardSearchRequest,
        timeout: Duration,
    ) -> Result<ShardSearchReply> {
        let client = pool.get(addr).await?;
        match tokio::time::timeout(timeout, client.search(context::current(), request)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(crate::client::rpc_error(e)),
            Err(_) => Err(ClusterError::Timeout(format!("shard search on {addr}"))),
        }
    }

    // ========================================================================
    // Ingest path
    // ========================================================================

    pub async fn index_document(&self, index: &str, doc_id: &str, doc: Value) -> Result<()> {
        let (shard_id, addr) = self.primary_for(index, doc_id)?;
        let client = self.pool.get(&addr).await?;
        self.unwrap_call(
            &addr,
            client.index_document(
                context::current(),
                shard_key(index, shard_id),
                doc_id.to_string(),
                doc,
            ),
        )
        .await
    }

    pub async fn delete_document(&self, index: &str, doc_id: &str) -> Result<()> {
        let (shard_id, addr) = self.primary_for(index, doc_id)?;
        let client = self.pool.get(&addr).await?;
        self.unwrap_call(
            &addr,
            client.delete_document(
                context::current(),
                shard_key(index, shard_id),
                doc_id.to_string(),
            ),
        )
        .await
    }

    pub async fn get_document(&self, index: &str, doc_id: &str) -> Result<Option<Value>> {
        let (shard_id, addr) = self.primary_for(index, doc_id)?;
        let client = self.pool.get(&addr).await?;
        self.unwrap_call(
            &addr,
            client.get_document(
                context::current(),
                shard_key(index, shard_id),
                doc_id.to_string(),
            ),
        )
        .await
    }

    /// Make recent writes searchable on every started copy of the index.
    pub async fn refresh_index(&self, index: &str) -> Result<()> {
        let state = self.view.cluster_state();
        let meta = state
            .index(index)
            .ok_or_else(|| ClusterError::NotFound(format!("index {index}")))?;
        for shard_id in 0..meta.num_shards {
            if let Some((_, addr)) = serving_copy(&state, index, shard_id) {
                let client = self.pool.get(&addr).await?;
                self.unwrap_call(
                    &addr,
                    client.refresh(context::current(), shard_key(index, shard_id)),
                )
                .await?;
            }
        }
        Ok(())
    }

    fn primary_for(&self, index: &str, doc_id: &str) -> Result<(u32, String)> {
        let state = self.view.cluster_state();
        let meta = state
            .index(index)
            .ok_or_else(|| ClusterError::NotFound(format!("index {index}")))?;
        let shard_id = router::shard_of(doc_id, meta.num_shards);
        let primary = state
            .primary_of(index, shard_id)
            .filter(|r| r.state == ShardState::Started)
            .ok_or_else(|| {
                ClusterError::Unavailable(format!("shard {index}/{shard_id} has no started primary"))
            })?;
        let node = state.node(&primary.node_id).ok_or_else(|| {
            ClusterError::Unavailable(format!("node {} not registered", primary.node_id))
        })?;
        Ok((shard_id, node.rpc_addr()))
    }

    async fn unwrap_call<T>(
        &self,
        addr: &str,
        call: impl std::future::Future<Output = std::result::Result<Result<T>, tarpc::client::RpcError>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.sub_request_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                self.pool.evict(addr);
                Err(crate::client::rpc_error(e))
            }
            Err(_) => {
                self.pool.evict(addr);
                Err(ClusterError::Timeout(format!("rpc to {addr}")))
            }
        }
    }
}

/// The serving copy of a shard: a Started copy whose node is registered
/// and healthy, primaries preferred.
fn serving_copy(state: &ClusterState, index: &str, shard_id: u32) -> Option<(String, String)> {
    let mut copies = state.routing_for_shard(index, shard_id);
    copies.sort_by_key(|r| !r.is_primary);
    for copy in copies {
        if copy.state != ShardState::Started {
            continue;
        }
        if let Some(node) = state.node(&copy.node_id) {
            if node.is_healthy() {
                return Some((copy.node_id.clone(), node.rpc_addr()));
            }
        }
    }
    None
}

/// Merge per-shard replies into the global page.
fn merge(
    replies: Vec<(u32, ShardSearchReply)>,
    failures: Vec<ShardFailure>,
    from: usize,
    size: usize,
) -> SearchResults {
    let total_hits: usize = replies.iter().map(|(_, r)| r.total_hits).sum();
    let max_score = replies
        .iter()
        .map(|(_, r)| r.max_score)
        .fold(0.0f32, f32::max);

    // Rank globally: score descending, ties by ascending
    // (shard_index, internal doc id) for determinism.
    let mut ranked: Vec<(u32, u64, crate::service::WireHit)> = replies
        .iter()
        .flat_map(|(shard_id, reply)| {
            reply
                .hits
                .iter()
                .map(move |hit| (*shard_id, hit.internal_id, hit.clone()))
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.2.score
            .partial_cmp(&a.2.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
            .then_with(|| a.1.cmp(&b.1))
    });

    let hits = ranked
        .into_iter()
        .skip(from)
        .take(size)
        .map(|(shard_id, _, hit)| SearchHit {
            doc_id: hit.doc_id,
            score: hit.score,
            shard_id,
            fields: hit.fields,
        })
        .collect();

    // Fold aggregation partials shard by shard, then finalize.
    let mut merged: BTreeMap<String, AggPartial> = BTreeMap::new();
    for (_, reply) in replies {
        for (name, partial) in reply.aggregations {
            match merged.get_mut(&name) {
                Some(existing) => {
                    if let Err(e) = existing.merge(&partial) {
                        tracing::error!(agg = %name, error = %e, "aggregation merge mismatch");
                    }
                }
                None => {
                    merged.insert(name, partial);
                }
            }
        }
    }
    let aggregations = merged
        .into_iter()
        .map(|(name, partial)| (name, partial.finalize()))
        .collect();

    let timed_out = failures.iter().any(|f| f.timed_out);
    SearchResults {
        total_hits,
        max_score,
        hits,
        aggregations,
        shard_failures: failures,
        timed_out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::WireHit;
    use quidditch::aggregations::StatsPartial;
    use serde_json::json;

    fn reply(total: usize, hits: Vec<(u64, &str, f32)>) -> ShardSearchReply {
        ShardSearchReply {
            total_hits: total,
            max_score: hits.iter().map(|(_, _, s)| *s).fold(0.0, f32::max),
            hits: hits
                .into_iter()
                .map(|(internal_id, doc_id, score)| WireHit {
                    internal_id,
                    doc_id: doc_id.to_string(),
                    score,
                    fields: json!({}),
                })
                .collect(),
            aggregations: BTreeMap::new(),
            filter_evaluated: 0,
            filter_matched: 0,
        }
    }

    #[test]
    fn test_merge_ranks_globally() {
        let replies = vec![
            (0, reply(2, vec![(1, "a", 3.0), (2, "b", 1.0)])),
            (1, reply(2, vec![(1, "c", 2.0), (2, "d", 0.5)])),
        ];
        let merged = merge(replies, vec![], 0, 3);
        assert_eq!(merged.total_hits, 4);
        let ids: Vec<&str> = merged.hits.iter().map(|h| h.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
        assert_eq!(merged.max_score, 3.0);
    }

    #[test]
    fn test_merge_tie_break_by_shard_then_doc() {
        let replies = vec![
            (1, reply(1, vec![(7, "s1", 1.0)])),
            (0, reply(2, vec![(9, "s0-b", 1.0), (3, "s0-a", 1.0)])),
        ];
        let merged = merge(replies, vec![], 0, 10);
        let ids: Vec<&str> = merged.hits.iter().map(|h| h.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["s0-a", "s0-b", "s1"]);
    }

    #[test]
    fn test_merge_applies_global_pagination() {
        let replies = vec![
            (0, reply(3, vec![(1, "a", 5.0), (2, "b", 3.0), (3, "c", 1.0)])),
            (1, reply(3, vec![(1, "d", 4.0), (2, "e", 2.0), (3, "f", 0.5)])),
        ];
        let merged = merge(replies, vec![], 2, 2);
        let ids: Vec<&str> = merged.hits.iter().map(|h| h.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "e"]);
        assert_eq!(merged.total_hits, 6);
    }

    #[test]
    fn test_merge_aggregation_partials() {
        let mut reply_a = reply(1, vec![(1, "a", 1.0)]);
        let mut stats = StatsPartial::default();
        stats.observe(10.0);
        reply_a
            .aggregations
            .insert("price".into(), AggPartial::Stats(stats));

        let mut reply_b = reply(1, vec![(1, "b", 1.0)]);
        let mut stats = StatsPartial::default();
        stats.observe(30.0);
        reply_b
            .aggregations
            .insert("price".into(), AggPartial::Stats(stats));

        let merged = merge(vec![(0, reply_a), (1, reply_b)], vec![], 0, 10);
        let out = &merged.aggregations["price"];
        assert_eq!(out["count"], 2);
        assert_eq!(out["avg"], 20.0);
        assert_eq!(out["min"], 10.0);
        assert_eq!(out["max"], 30.0);
    }

    #[test]
    fn test_merge_flags_timeouts() {
        let failures = vec![ShardFailure {
            shard_id: 2,
            node_id: Some("d3".into()),
            reason: "deadline".into(),
            timed_out: true,
        }];
        let merged = merge(vec![(0, reply(1, vec![(1, "a", 1.0)]))], failures, 0, 10);
        assert!(merged.timed_out);
        assert_eq!(merged.shard_failures.len(), 1);
    }
}
