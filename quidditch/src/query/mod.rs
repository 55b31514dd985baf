//! The query layer: a closed JSON query algebra and its executor.
//!
//! Queries arrive as JSON trees, are parsed into [`ast::QueryNode`] (unknown
//! kinds are rejected, never ignored) and executed by [`engine`] against a
//! shard's index store.

pub mod ast;
pub mod engine;

pub use ast::{QueryNode, RangeBounds};
pub use engine::{Hit, QueryEngine, SearchRequest, ShardSearchResult};
