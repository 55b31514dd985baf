//! The in-memory replicated log.
//!
//! Entries carry the state-machine command they were proposed with. The
//! log can be compacted up to a snapshot point; indices below
//! `first_index` live only in the snapshot store.

use crate::error::{ClusterError, Result};
use crate::state::Command;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub type Term = u64;
pub type LogIndex = u64;

/// What a log slot carries: a state-machine command, or the no-op a fresh
/// leader appends to commit its predecessors' entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    Noop,
    Command(Command),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub payload: EntryPayload,
}

#[derive(Debug, Default)]
pub struct RaftLog {
    entries: VecDeque<LogEntry>,
    /// Index of the first retained entry; everything below is snapshotted.
    first_index: LogIndex,
    snapshot_index: LogIndex,
    snapshot_term: Term,
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            first_index: 1,
            snapshot_index: 0,
            snapshot_term: 0,
        }
    }

    /// Rebuild from persisted entries and a snapshot point.
    pub fn restore(snapshot_index: LogIndex, snapshot_term: Term, entries: Vec<LogEntry>) -> Self {
        Self {
            first_index: snapshot_index + 1,
            snapshot_index,
            snapshot_term,
            entries: entries.into(),
        }
    }

    pub fn first_index(&self) -> LogIndex {
        self.first_index
    }

    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> Term {
        self.snapshot_term
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries
            .back()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_index)
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .back()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index {
            return None;
        }
        self.entries.get((index - self.first_index) as usize)
    }

    /// Term of the entry at `index`; index 0 and the snapshot point are
    /// answerable without the entry itself.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        if entry.index != self.last_index() + 1 {
            return Err(ClusterError::Internal(format!(
                "log gap: expected index {}, got {}",
                self.last_index() + 1,
                entry.index
            )));
        }
        self.entries.push_back(entry);
        Ok(())
    }

    /// Drop every entry at `index` and above (conflict resolution).
    pub fn truncate_from(&mut self, index: LogIndex) {
        if index < self.first_index {
            self.entries.clear();
            return;
        }
        self.entries.truncate((index - self.first_index) as usize);
    }

    /// Entries in `[from, to]`, clamped to what is retained.
    pub fn range(&self, from: LogIndex, to: LogIndex) -> Vec<LogEntry> {
        if to < from {
            return Vec::new();
        }
        let from = from.max(self.first_index);
        self.entries
            .iter()
            .filter(|e| e.index >= from && e.index <= to)
            .cloned()
            .collect()
    }

    /// All retained entries, for persistence.
    pub fn all(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Discard entries up to and including `index` after a snapshot.
    pub fn compact(&mut self, index: LogIndex, term: Term) {
        while self
            .entries
            .front()
            .map(|e| e.index <= index)
            .unwrap_or(false)
        {
            self.entries.pop_front();
        }
        self.snapshot_index = index;
        self.snapshot_term = term;
        self.first_index = index + 1;
    }

    /// Reset onto a received snapshot, dropping the whole log.
    pub fn reset_to_snapshot(&mut self, index: LogIndex, term: Term) {
        self.entries.clear();
        self.snapshot_index = index;
        self.snapshot_term = term;
        self.first_index = index + 1;
    }
}
