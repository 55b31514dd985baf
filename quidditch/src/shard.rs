//! Shard facade: one index partition on one data node.
//!
//! Composes the index store, the query engine and the expression filter
//! behind the operations the data-plane RPC surface exposes. Writes are
//! serialized by the store's writer mutex; searches run concurrently
//! against the shared reader snapshot.

use crate::aggregations::AggSpec;
use crate::error::Result;
use crate::filter::DocumentFilter;
use crate::index::{IndexStore, OpenMode, StoreOptions};
use crate::query::{QueryEngine, QueryNode, SearchRequest, ShardSearchResult};
use crate::schema::IndexSchema;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// One shard of an index, bound to its on-disk store.
pub struct Shard {
    index: String,
    shard_id: u32,
    store: IndexStore,
}

impl Shard {
    /// Open (or create) the shard's store under `path`.
    pub fn open(
        path: impl AsRef<Path>,
        index: impl Into<String>,
        shard_id: u32,
        schema: IndexSchema,
        options: StoreOptions,
    ) -> Result<Self> {
        let store = IndexStore::open(path, OpenMode::CreateOrAppend, schema, options)?;
        Ok(Self {
            index: index.into(),
            shard_id,
            store,
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    /// Buffer one document write. Visibility is batched: nothing is
    /// observable until `refresh`.
    pub fn index_document(&self, doc_id: &str, doc: &Value) -> Result<()> {
        self.store.add_document(doc_id, doc)
    }

    pub fn delete_document(&self, doc_id: &str) -> Result<()> {
        self.store.delete_document(doc_id)
    }

    /// Commit buffered writes and advance the reader onto them.
    pub fn refresh(&self) -> Result<()> {
        self.store.commit()?;
        self.store.refresh()
    }

    /// Spill buffered writes to segment files without a visibility change.
    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    pub fn get_document(&self, doc_id: &str) -> Result<Option<Value>> {
        Ok(self.store.get_by_id(doc_id)?.map(|(_, fields)| fields))
    }

    pub fn doc_count(&self) -> usize {
        self.store.doc_count()
    }

    /// Execute a search from its wire form: a JSON query tree, optional
    /// filter expression bytes, pagination and an optional aggregation map.
    pub fn search_raw(
        &self,
        query_json: &Value,
        filter_bytes: Option<&[u8]>,
        from: usize,
        size: usize,
        aggs_json: Option<&Value>,
    ) -> Result<ShardSearchResult> {
        let query = QueryNode::parse(query_json)?;
        let filter = filter_bytes
            .map(DocumentFilter::from_bytes)
            .transpose()?;
        let aggs = match aggs_json {
            Some(value) => AggSpec::parse_map(value)?,
            None => BTreeMap::new(),
        };
        let request = SearchRequest {
            query,
            from,
            size,
            filter,
            aggs,
        };
        self.search(&request)
    }

    pub fn search(&self, request: &SearchRequest) -> Result<ShardSearchResult> {
        QueryEngine::new(&self.store).search(request)
    }

    /// Release the writer, committing when the store is configured to.
    pub fn close(&self) -> Result<()> {
        self.store.close()
    }
}

/// Convenience for tests and embedders: open a shard with default store
/// options.
pub fn open_shard(
    path: impl AsRef<Path>,
    index: &str,
    shard_id: u32,
    schema: IndexSchema,
) -> Result<Shard> {
    Shard::open(path, index, shard_id, schema, StoreOptions::default())
}
