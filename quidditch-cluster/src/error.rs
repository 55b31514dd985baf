//! Cluster error taxonomy.
//!
//! Serializable so errors cross the RPC boundary intact. The variants map
//! one-to-one onto the failure kinds callers are expected to branch on:
//! leadership redirects, deadline expiry, validation, partial fan-out
//! failure and invariant violations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum ClusterError {
    /// Write attempted on a non-leader; carries the current leader's
    /// address when one is known.
    #[error("not the leader{}", leader_hint(.leader))]
    NotLeader { leader: Option<String> },

    /// Deadline exceeded. The outcome of a submitted command is undefined;
    /// callers retry with idempotent payloads.
    #[error("timeout: {0}")]
    Timeout(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// No healthy data nodes, or every shard of an index unreachable.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Some shard sub-requests failed; the successful partial result is
    /// returned alongside this marker in `shard_failures`.
    #[error("partial failure: {0}")]
    PartialFailure(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

fn leader_hint(leader: &Option<String>) -> String {
    match leader {
        Some(addr) => format!(", leader is {addr}"),
        None => String::new(),
    }
}

impl ClusterError {
    /// Error kind label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterError::NotLeader { .. } => "not_leader",
            ClusterError::Timeout(_) => "timeout",
            ClusterError::AlreadyExists(_) => "already_exists",
            ClusterError::NotFound(_) => "not_found",
            ClusterError::BadRequest(_) => "bad_request",
            ClusterError::Unavailable(_) => "unavailable",
            ClusterError::PartialFailure(_) => "partial_failure",
            ClusterError::Transport(_) => "transport",
            ClusterError::Storage(_) => "storage",
            ClusterError::Internal(_) => "internal",
        }
    }
}

impl From<quidditch::Error> for ClusterError {
    fn from(err: quidditch::Error) -> Self {
        match err {
            quidditch::Error::BadQuery(msg) | quidditch::Error::BadRequest(msg) => {
                ClusterError::BadRequest(msg)
            }
            quidditch::Error::ShardNotFound(msg) | quidditch::Error::DocumentNotFound(msg) => {
                ClusterError::NotFound(msg)
            }
            quidditch::Error::ExprDecode(msg) => ClusterError::BadRequest(msg),
            other => ClusterError::Internal(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        ClusterError::Transport(err.to_string())
    }
}

impl From<bincode::Error> for ClusterError {
    fn from(err: bincode::Error) -> Self {
        ClusterError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_leader_display_carries_hint() {
        let err = ClusterError::NotLeader {
            leader: Some("10.0.0.2:7310".into()),
        };
        assert!(err.to_string().contains("10.0.0.2:7310"));

        let err = ClusterError::NotLeader { leader: None };
        assert_eq!(err.to_string(), "not the leader");
    }

    #[test]
    fn test_serde_roundtrip() {
        let err = ClusterError::Timeout("apply".into());
        let json = serde_json::to_string(&err).unwrap();
        let back: ClusterError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), "timeout");
    }
}
