//! Per-document expression filters.
//!
//! A filter is a compact byte-serialized scalar expression evaluated
//! against each candidate document before it is admitted to the result
//! heap. Evaluation failures (division by zero, domain errors) are
//! suppressed at this boundary and counted: a failing document is simply
//! not a match.

pub mod codec;
pub mod expr;

pub use codec::{decode, encode};
pub use expr::{BinaryOp, Expr, ExprValue, FuncKind, ResultType, UnaryOp};

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Observable evaluation counters for one filter's lifetime.
#[derive(Debug, Default)]
pub struct FilterStats {
    evaluated: AtomicU64,
    matched: AtomicU64,
    failed: AtomicU64,
}

impl FilterStats {
    pub fn evaluated(&self) -> u64 {
        self.evaluated.load(Ordering::Relaxed)
    }

    pub fn matched(&self) -> u64 {
        self.matched.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// A decoded filter expression plus its counters.
#[derive(Debug)]
pub struct DocumentFilter {
    expr: Expr,
    stats: FilterStats,
}

impl DocumentFilter {
    pub fn new(expr: Expr) -> Self {
        Self {
            expr,
            stats: FilterStats::default(),
        }
    }

    /// Decode a filter from its wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(Self::new(decode(bytes)?))
    }

    /// Evaluate against one document's stored fields without suppression.
    pub fn evaluate(&self, doc: &Value) -> crate::Result<bool> {
        self.expr
            .eval(doc)
            .map(|value| value.truthy())
            .map_err(|e| crate::Error::EvaluationFailed(e.to_string()))
    }

    /// The filter boundary: per-document failures are non-matches, counted
    /// but never propagated.
    pub fn matches(&self, doc: &Value) -> bool {
        self.stats.evaluated.fetch_add(1, Ordering::Relaxed);
        match self.evaluate(doc) {
            Ok(matched) => {
                if matched {
                    self.stats.matched.fetch_add(1, Ordering::Relaxed);
                }
                matched
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(error = %err, "filter evaluation failed, treating as non-match");
                false
            }
        }
    }

    pub fn stats(&self) -> &FilterStats {
        &self.stats
    }
}
