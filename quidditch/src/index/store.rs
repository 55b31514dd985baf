use crate::error::{Error, Result};
use crate::schema::{FieldKind, IndexSchema, ID_FIELD};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tantivy::collector::{Count, TopDocs};
use tantivy::query::{Query, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, OwnedValue, Schema as EngineSchema};
use tantivy::{
    DocAddress, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term,
};

/// Stable per-shard document handle: segment ordinal in the high 32 bits,
/// segment-local doc id in the low 32. Valid for the lifetime of one reader
/// generation; orderable for deterministic tie-breaks.
pub type InternalDocId = u64;

pub fn internal_doc_id(addr: DocAddress) -> InternalDocId {
    ((addr.segment_ord as u64) << 32) | addr.doc_id as u64
}

pub fn doc_address(id: InternalDocId) -> DocAddress {
    DocAddress {
        segment_ord: (id >> 32) as u32,
        doc_id: (id & 0xffff_ffff) as u32,
    }
}

/// How `open` treats the target directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Fail if an index already exists at the path.
    Create,
    /// Fail unless an index already exists at the path.
    Append,
    /// Create if absent, otherwise open.
    CreateOrAppend,
}

/// Store tuning knobs, surfaced from node configuration.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Indexing buffer in megabytes.
    pub ram_buffer_mb: usize,
    /// Whether `close` commits pending writes.
    pub commit_on_close: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            ram_buffer_mb: 64,
            commit_on_close: true,
        }
    }
}

/// Result of a top-k search against one shard store.
#[derive(Debug, Clone)]
pub struct TopDocsResult {
    pub total_hits: usize,
    pub max_score: f32,
    pub hits: Vec<(InternalDocId, f32)>,
}

/// A single shard's index store.
///
/// Exactly one writer exists per directory; it is serialized behind the
/// store's own mutex. Readers are shared and only advance on `refresh`.
pub struct IndexStore {
    path: PathBuf,
    schema: IndexSchema,
    engine_schema: EngineSchema,
    field_map: HashMap<String, Field>,
    index: Index,
    reader: IndexReader,
    writer: Mutex<Option<IndexWriter>>,
    options: StoreOptions,
}

impl IndexStore {
    /// Open a shard store at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        mode: OpenMode,
        schema: IndexSchema,
        options: StoreOptions,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        schema.validate()?;
        std::fs::create_dir_all(&path)?;

        // The engine drops a meta.json into every index directory; its
        // presence is the existence check.
        let exists = path.join("meta.json").exists();
        let index = match (mode, exists) {
            (OpenMode::Create, true) => {
                return Err(Error::Store(format!(
                    "index already exists at {}",
                    path.display()
                )))
            }
            (OpenMode::Append, false) => {
                return Err(Error::Store(format!(
                    "no index found at {}",
                    path.display()
                )))
            }
            (OpenMode::Create, false) | (OpenMode::CreateOrAppend, false) => {
                let (engine_schema, _) = schema.build_engine_schema();
                Index::create_in_dir(&path, engine_schema)?
            }
            (OpenMode::Append, true) | (OpenMode::CreateOrAppend, true) => {
                Index::open_in_dir(&path)?
            }
        };

        // Trust the on-disk schema when appending; it is authoritative for
        // field handles.
        let engine_schema = index.schema();
        let mut field_map = HashMap::new();
        for (field, entry) in engine_schema.fields() {
            field_map.insert(entry.name().to_string(), field);
        }

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        let writer = index.writer(options.ram_buffer_mb * 1024 * 1024)?;

        Ok(Self {
            path,
            schema,
            engine_schema,
            field_map,
            index,
            reader,
            writer: Mutex::new(Some(writer)),
            options,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &IndexSchema {
        &self.schema
    }

    pub fn field(&self, name: &str) -> Option<Field> {
        self.field_map.get(name).copied()
    }

    /// Buffer one document for indexing. Re-adding an id replaces the prior
    /// version at the next commit. Not visible to readers until `commit`
    /// followed by a reader reopen or `refresh`.
    pub fn add_document(&self, doc_id: &str, fields: &Value) -> Result<()> {
        let mut guard = self.writer.lock();
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::Store("store is closed".to_string()))?;

        let id_field = self.field_map[ID_FIELD];
        writer.delete_term(Term::from_field_text(id_field, doc_id));

        let mut doc = TantivyDocument::new();
        doc.add_text(id_field, doc_id);

        for (path, value) in IndexSchema::flatten(fields) {
            let Some(def) = self.schema.field(&path) else {
                tracing::debug!(doc_id, field = %path, "skipping unmapped field");
                continue;
            };
            let Some(field) = self.field_map.get(&path).copied() else {
                continue;
            };
            if !add_value(&mut doc, field, def.kind, &value) {
                tracing::warn!(doc_id, field = %path, ?value, "field value does not match schema kind, skipped");
            }
        }

        writer.add_document(doc)?;
        Ok(())
    }

    /// Buffer a tombstone for the given document id.
    pub fn delete_document(&self, doc_id: &str) -> Result<()> {
        let mut guard = self.writer.lock();
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::Store("store is closed".to_string()))?;
        let id_field = self.field_map[ID_FIELD];
        writer.delete_term(Term::from_field_text(id_field, doc_id));
        Ok(())
    }

    /// Make buffered writes durable. A reader opened (or refreshed) after a
    /// successful commit observes them; the current reader does not move.
    pub fn commit(&self) -> Result<()> {
        let mut guard = self.writer.lock();
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::Store("store is closed".to_string()))?;
        writer.commit()?;
        Ok(())
    }

    /// Spill the write buffer to segment files. The held reader's view does
    /// not change; the engine's smallest durable spill unit is a commit.
    pub fn flush(&self) -> Result<()> {
        self.commit()
    }

    /// Advance the shared reader onto the latest committed segments.
    pub fn refresh(&self) -> Result<()> {
        self.reader.reload()?;
        Ok(())
    }

    /// A consistent snapshot of committed state.
    pub fn searcher(&self) -> tantivy::Searcher {
        self.reader.searcher()
    }

    /// Live (non-deleted) document count of the current reader snapshot.
    pub fn doc_count(&self) -> usize {
        self.searcher()
            .segment_readers()
            .iter()
            .map(|r| r.num_docs() as usize)
            .sum()
    }

    /// Top-k search with exact total hit count.
    pub fn search(&self, query: &dyn Query, k: usize) -> Result<TopDocsResult> {
        let searcher = self.searcher();
        let (hits, total_hits) =
            searcher.search(query, &(TopDocs::with_limit(k.max(1)), Count))?;
        let max_score = hits.first().map(|(score, _)| *score).unwrap_or(0.0);
        Ok(TopDocsResult {
            total_hits,
            max_score,
            hits: hits
                .into_iter()
                .map(|(score, addr)| (internal_doc_id(addr), score))
                .collect(),
        })
    }

    /// Hydrate the stored fields of one document. Every stored field of the
    /// schema is returned.
    pub fn get_document(&self, id: InternalDocId) -> Result<Value> {
        let searcher = self.searcher();
        let doc: TantivyDocument = searcher.doc(doc_address(id))?;
        Ok(self.stored_fields(&doc))
    }

    /// Look up a document by its caller-supplied id.
    pub fn get_by_id(&self, doc_id: &str) -> Result<Option<(InternalDocId, Value)>> {
        let searcher = self.searcher();
        let id_field = self.field_map[ID_FIELD];
        let query = TermQuery::new(
            Term::from_field_text(id_field, doc_id),
            IndexRecordOption::Basic,
        );
        let hits = searcher.search(&query, &TopDocs::with_limit(1))?;
        match hits.first() {
            Some((_score, addr)) => {
                let doc: TantivyDocument = searcher.doc(*addr)?;
                Ok(Some((internal_doc_id(*addr), self.stored_fields(&doc))))
            }
            None => Ok(None),
        }
    }

    /// Hydrate stored fields through a caller-held searcher, keeping the
    /// document address and the snapshot it came from in lockstep.
    pub fn fields_of(&self, searcher: &tantivy::Searcher, id: InternalDocId) -> Result<Value> {
        let doc: TantivyDocument = searcher.doc(doc_address(id))?;
        Ok(self.stored_fields(&doc))
    }

    fn stored_fields(&self, doc: &TantivyDocument) -> Value {
        let mut fields = serde_json::Map::new();
        for (field, entry) in self.engine_schema.fields() {
            if !entry.is_stored() {
                continue;
            }
            let values: Vec<Value> = doc
                .get_all(field)
                .filter_map(owned_value_to_json)
                .collect();
            match values.len() {
                0 => {}
                1 => {
                    fields.insert(entry.name().to_string(), values.into_iter().next().unwrap());
                }
                _ => {
                    fields.insert(entry.name().to_string(), Value::Array(values));
                }
            }
        }
        Value::Object(fields)
    }

    /// Release the writer, committing first when configured to.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.writer.lock();
        if let Some(mut writer) = guard.take() {
            if self.options.commit_on_close {
                writer.commit()?;
            }
        }
        Ok(())
    }
}

/// Convert one JSON leaf onto an engine field, honoring the schema kind.
/// Returns false when the value cannot be represented.
fn add_value(doc: &mut TantivyDocument, field: Field, kind: FieldKind, value: &Value) -> bool {
    match (kind, value) {
        (FieldKind::Text | FieldKind::Keyword, Value::String(s)) => {
            doc.add_text(field, s);
            true
        }
        (FieldKind::I64, Value::Number(n)) => match n.as_i64() {
            Some(v) => {
                doc.add_i64(field, v);
                true
            }
            None => false,
        },
        (FieldKind::F64, Value::Number(n)) => match n.as_f64() {
            Some(v) => {
                doc.add_f64(field, v);
                true
            }
            None => false,
        },
        (FieldKind::Bool, Value::Bool(b)) => {
            doc.add_bool(field, *b);
            true
        }
        (FieldKind::Stored, Value::String(s)) => {
            doc.add_text(field, s);
            true
        }
        (FieldKind::Stored, other) => {
            doc.add_text(field, other.to_string());
            true
        }
        _ => false,
    }
}

/// Convert a stored engine value back to JSON for hydration.
fn owned_value_to_json(value: &OwnedValue) -> Option<Value> {
    match value {
        OwnedValue::Str(s) => Some(Value::String(s.to_string())),
        OwnedValue::U64(n) => Some(Value::Number((*n).into())),
        OwnedValue::I64(n) => Some(Value::Number((*n).into())),
        OwnedValue::F64(n) => serde_json::Number::from_f64(*n).map(Value::Number),
        OwnedValue::Bool(b) => Some(Value::Bool(*b)),
        _ => None,
    }
}
