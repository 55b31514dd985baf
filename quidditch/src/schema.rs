//! Index schemas: field classification and the mapping onto the embedded
//! engine's schema.
//!
//! Every index carries a schema fixed at creation time. Fields fall into
//! four classes: analyzed text (tokenized, scored), keyword (verbatim
//! terms), numeric (range queries and aggregations), and stored-only
//! (hydration without indexing). Booleans are indexed as exact values.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tantivy::schema::{
    Field, IndexRecordOption, NumericOptions, Schema as EngineSchema, SchemaBuilder,
    TextFieldIndexing, TextOptions, STORED, STRING,
};

/// Reserved field holding the caller-supplied document id.
pub const ID_FIELD: &str = "_id";

/// How a field is indexed and queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Tokenized, lowercased, position-indexed; scored with BM25.
    Text,
    /// Indexed verbatim as a single term; exact match and terms buckets.
    Keyword,
    /// Signed integer, indexed for range queries and doc-value reads.
    I64,
    /// Floating point, indexed for range queries and doc-value reads.
    F64,
    /// Exact boolean term.
    Bool,
    /// Recoverable via document retrieval only, never indexed.
    Stored,
}

/// A single field definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    /// Whether the raw value is kept for hydration. Defaults to true.
    #[serde(default = "default_stored")]
    pub stored: bool,
}

fn default_stored() -> bool {
    true
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            stored: true,
        }
    }
}

/// Schema for one index: the complete set of field definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub fields: Vec<FieldDef>,
}

impl IndexSchema {
    pub fn new(fields: Vec<FieldDef>) -> Self {
        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validate that the schema is usable: unique names, no reserved names.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for def in &self.fields {
            if def.name == ID_FIELD {
                return Err(Error::Schema(format!(
                    "field name {ID_FIELD} is reserved"
                )));
            }
            if !seen.insert(def.name.as_str()) {
                return Err(Error::Schema(format!("duplicate field {}", def.name)));
            }
        }
        Ok(())
    }

    /// Build the embedded engine schema plus a name -> field handle map.
    pub fn build_engine_schema(&self) -> (EngineSchema, HashMap<String, Field>) {
        let mut builder: SchemaBuilder = EngineSchema::builder();
        let mut field_map = HashMap::new();

        let id_field = builder.add_text_field(ID_FIELD, STRING | STORED);
        field_map.insert(ID_FIELD.to_string(), id_field);

        for def in &self.fields {
            let field = match def.kind {
                FieldKind::Text => {
                    let mut options = TextOptions::default().set_indexing_options(
                        TextFieldIndexing::default()
                            .set_tokenizer("default")
                            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
                    );
                    if def.stored {
                        options = options.set_stored();
                    }
                    builder.add_text_field(&def.name, options)
                }
                FieldKind::Keyword => {
                    let mut opts = STRING;
                    if def.stored {
                        opts = opts | STORED;
                    }
                    builder.add_text_field(&def.name, opts)
                }
                FieldKind::I64 => {
                    let mut opts = NumericOptions::default().set_indexed();
                    if def.stored {
                        opts = opts.set_stored();
                    }
                    builder.add_i64_field(&def.name, opts)
                }
                FieldKind::F64 => {
                    let mut opts = NumericOptions::default().set_indexed();
                    if def.stored {
                        opts = opts.set_stored();
                    }
                    builder.add_f64_field(&def.name, opts)
                }
                FieldKind::Bool => {
                    let mut opts = NumericOptions::default().set_indexed();
                    if def.stored {
                        opts = opts.set_stored();
                    }
                    builder.add_bool_field(&def.name, opts)
                }
                FieldKind::Stored => builder.add_text_field(&def.name, STORED),
            };
            field_map.insert(def.name.clone(), field);
        }

        (builder.build(), field_map)
    }

    /// Flatten a JSON document into `(path, leaf value)` pairs the way the
    /// ingest path indexes them: nested objects become dotted paths, arrays
    /// contribute one pair per element.
    pub fn flatten(doc: &serde_json::Value) -> Vec<(String, serde_json::Value)> {
        let mut out = Vec::new();
        if let serde_json::Value::Object(map) = doc {
            for (key, value) in map {
                flatten_into(key, value, &mut out);
            }
        }
        out
    }
}

fn flatten_into(path: &str, value: &serde_json::Value, out: &mut Vec<(String, serde_json::Value)>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, nested) in map {
                flatten_into(&format!("{path}.{key}"), nested, out);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                flatten_into(path, item, out);
            }
        }
        other => out.push((path.to_string(), other.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_rejects_reserved_name() {
        let schema = IndexSchema::new(vec![FieldDef::new("_id", FieldKind::Keyword)]);
        assert!(schema.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let schema = IndexSchema::new(vec![
            FieldDef::new("title", FieldKind::Text),
            FieldDef::new("title", FieldKind::Keyword),
        ]);
        assert!(schema.validate().is_err());
    }

    #[test]
    fn test_engine_schema_has_id() {
        let schema = IndexSchema::new(vec![FieldDef::new("title", FieldKind::Text)]);
        let (_engine, map) = schema.build_engine_schema();
        assert!(map.contains_key(ID_FIELD));
        assert!(map.contains_key("title"));
    }

    #[test]
    fn test_flatten_nested_and_arrays() {
        let doc = json!({
            "title": "quidditch",
            "meta": {"author": "r", "year": 2021},
            "tags": ["a", "b"]
        });
        let mut pairs = IndexSchema::flatten(&doc);
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        let paths: Vec<&str> = pairs.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(
            paths,
            vec!["meta.author", "meta.year", "tags", "tags", "title"]
        );
    }

    #[test]
    fn test_schema_serde_roundtrip() {
        let schema = IndexSchema::new(vec![
            FieldDef::new("name", FieldKind::Text),
            FieldDef::new("price", FieldKind::F64),
        ]);
        let json = serde_json::to_string(&schema).unwrap();
        let back: IndexSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(back.fields.len(), 2);
        assert_eq!(back.fields[1].kind, FieldKind::F64);
        assert!(back.fields[0].stored);
    }
}
