//! The state machine wrapper: shared-reader access, snapshot and restore.

use super::{ClusterState, Command};
use crate::error::{ClusterError, Result};
use parking_lot::RwLock;

/// Deterministic apply of committed commands onto in-memory cluster state.
///
/// Readers clone a consistent snapshot under the read lock; the consensus
/// apply loop is the only writer.
pub struct StateMachine {
    state: RwLock<ClusterState>,
}

impl StateMachine {
    pub fn new(cluster_uuid: String) -> Self {
        Self {
            state: RwLock::new(ClusterState::new(cluster_uuid)),
        }
    }

    /// Apply one committed command. Returns the state version after apply.
    pub fn apply(&self, command: &Command) -> Result<u64> {
        let mut state = self.state.write();
        state.apply(command)?;
        tracing::debug!(kind = command.kind(), version = state.version, "applied command");
        Ok(state.version)
    }

    /// A consistent point-in-time copy of the whole state.
    pub fn read(&self) -> ClusterState {
        self.state.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    /// Full serialization of the state for the snapshot store.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        bincode::serialize(&*self.state.read())
            .map_err(|e| ClusterError::Storage(e.to_string()))
    }

    /// Replace the state atomically from a snapshot.
    pub fn restore(&self, bytes: &[u8]) -> Result<()> {
        let restored: ClusterState =
            bincode::deserialize(bytes).map_err(|e| ClusterError::Storage(e.to_string()))?;
        *self.state.write() = restored;
        Ok(())
    }
}
