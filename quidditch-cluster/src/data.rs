//! Shard hosting on a data node.
//!
//! Owns every shard directory under `<data_dir>/shards/` and serves the
//! data-plane operations the master and the coordinator call. Search work
//! is synchronous engine code, so it runs on the blocking pool.

use crate::error::{ClusterError, Result};
use crate::service::{shard_key, ShardSearchReply, ShardSearchRequest, ShardStats, WireHit};
use parking_lot::RwLock;
use quidditch::index::StoreOptions;
use quidditch::schema::IndexSchema;
use quidditch::shard::Shard;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

pub struct DataNode {
    shards_dir: PathBuf,
    options: StoreOptions,
    shards: RwLock<HashMap<String, Arc<Shard>>>,
}

impl DataNode {
    pub fn new(shards_dir: impl Into<PathBuf>, options: StoreOptions) -> Self {
        Self {
            shards_dir: shards_dir.into(),
            options,
            shards: RwLock::new(HashMap::new()),
        }
    }

    /// Create (or reopen) a shard. Idempotent: a repeated CreateShard from
    /// a retrying master is an acknowledgement, not an error.
    pub fn create_shard(&self, index: &str, shard_id: u32, schema: IndexSchema) -> Result<()> {
        let key = shard_key(index, shard_id);
        if self.shards.read().contains_key(&key) {
            return Ok(());
        }
        let path = self.shards_dir.join(index).join(shard_id.to_string());
        let shard = Shard::open(path, index, shard_id, schema, self.options.clone())?;
        tracing::info!(shard = %key, "shard created");
        self.shards.write().insert(key, Arc::new(shard));
        Ok(())
    }

    /// Drop a shard and delete its directory.
    pub fn remove_shard(&self, index: &str, shard_id: u32) -> Result<()> {
        let key = shard_key(index, shard_id);
        if let Some(shard) = self.shards.write().remove(&key) {
            shard.close()?;
        }
        let path = self.shards_dir.join(index).join(shard_id.to_string());
        if path.exists() {
            std::fs::remove_dir_all(&path)
                .map_err(|e| ClusterError::Storage(e.to_string()))?;
        }
        Ok(())
    }

    pub fn shard(&self, key: &str) -> Result<Arc<Shard>> {
        self.shards
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("shard {key}")))
    }

    pub fn shard_keys(&self) -> Vec<String> {
        self.shards.read().keys().cloned().collect()
    }

    pub fn index_document(&self, key: &str, doc_id: &str, doc: &Value) -> Result<()> {
        let shard = self.shard(key)?;
        shard.index_document(doc_id, doc)?;
        Ok(())
    }

    pub fn delete_document(&self, key: &str, doc_id: &str) -> Result<()> {
        let shard = self.shard(key)?;
        shard.delete_document(doc_id)?;
        Ok(())
    }

    pub fn get_document(&self, key: &str, doc_id: &str) -> Result<Option<Value>> {
        let shard = self.shard(key)?;
        Ok(shard.get_document(doc_id)?)
    }

    pub fn refresh(&self, key: &str) -> Result<()> {
        let shard = self.shard(key)?;
        shard.refresh()?;
        Ok(())
    }

    pub fn flush(&self, key: &str) -> Result<()> {
        let shard = self.shard(key)?;
        shard.flush()?;
        Ok(())
    }

    pub fn stats(&self, key: &str) -> Result<ShardStats> {
        let shard = self.shard(key)?;
        Ok(ShardStats {
            shard_key: key.to_string(),
            doc_count: shard.doc_count(),
        })
    }

    /// Run one shard search on the blocking pool.
    pub async fn search(&self, request: ShardSearchRequest) -> Result<ShardSearchReply> {
        let shard = self.shard(&request.shard_key)?;
        let reply = tokio::task::spawn_blocking(move || -> Result<ShardSearchReply> {
            let result = shard.search_raw(
                &request.query,
                request.filter.as_deref(),
                request.from,
                request.size,
                request.aggs.as_ref(),
            )?;
            Ok(ShardSearchReply {
                total_hits: result.total_hits,
                max_score: result.max_score,
                hits: result
                    .hits
                    .into_iter()
                    .map(|h| WireHit {
                        internal_id: h.internal_id,
                        doc_id: h.doc_id,
                        score: h.score,
                        fields: h.fields,
                    })
                    .collect(),
                aggregations: result.aggregations,
                filter_evaluated: result.filter_evaluated,
                filter_matched: result.filter_matched,
            })
        })
        .await
        .map_err(|e| ClusterError::Internal(format!("search task panicked: {e}")))??;
        Ok(reply)
    }

    /// Close every shard, committing pending writes where configured.
    pub fn close_all(&self) {
        for (key, shard) in self.shards.write().drain() {
            if let Err(e) = shard.close() {
                tracing::warn!(shard = %key, error = %e, "failed to close shard");
            }
        }
    }
}
