//! Per-shard inverted-index store.
//!
//! Wraps the embedded index engine behind a narrow contract: buffered
//! writes, explicit commit/flush/refresh, snapshot readers, top-k search
//! and stored-field hydration. The engine owns postings, positions,
//! field-length statistics and BM25 scoring (`k1 = 1.2`, `b = 0.75`).

mod store;

pub use store::{
    doc_address, internal_doc_id, IndexStore, InternalDocId, OpenMode, StoreOptions,
    TopDocsResult,
};
