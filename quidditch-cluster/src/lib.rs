//! Quidditch cluster control plane and coordination.
//!
//! # Architecture
//!
//! - **State**: the replicated state machine over cluster metadata
//!   (indices, nodes, shard routing), mutated only by committed commands
//! - **Consensus**: single-leader log replication driving the state
//!   machine, with durable log/stable/snapshot stores per master node
//! - **Allocator**: pure placement and rebalancing decisions
//! - **Master**: admin surface turning requests into commands and
//!   data-plane RPCs
//! - **Data**: per-node shard hosting behind the data RPC surface
//! - **Coordinator**: scatter-gather query execution with ranked merging
//! - **Router**: stable document-to-shard hashing

pub mod allocator;
pub mod client;
pub mod consensus;
pub mod coordinator;
pub mod data;
pub mod error;
pub mod master;
pub mod router;
pub mod server;
pub mod service;
pub mod state;

pub use error::{ClusterError, Result};
pub use state::{ClusterState, Command, IndexMeta, NodeMeta, ShardRouting, StateMachine};
