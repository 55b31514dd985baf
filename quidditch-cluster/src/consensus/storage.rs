//! Durable consensus state under `<data_dir>/consensus/`.
//!
//! Three stores: the log (length-prefixed bincode frames, appended on
//! write and rewritten on truncation/compaction), the stable store
//! (current term and vote, written atomically via rename) and the
//! snapshot store (one file per snapshot, last two retained).

use super::log::{EntryPayload, LogEntry, LogIndex, Term};
use crate::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Snapshots kept on disk.
const SNAPSHOT_RETENTION: usize = 2;

// ============================================================================
// Log store
// ============================================================================

pub struct LogStore {
    path: PathBuf,
    file: File,
}

impl LogStore {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join("log.bin");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .map_err(|e| ClusterError::Storage(format!("open log store: {e}")))?;
        Ok(Self { path, file })
    }

    /// Append one entry as a length-prefixed frame and fsync.
    pub fn append(&mut self, entry: &LogEntry) -> Result<()> {
        let frame = bincode::serialize(entry)?;
        self.file.write_all(&(frame.len() as u32).to_le_bytes())?;
        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Read back every persisted entry. A torn trailing frame from a crash
    /// mid-write is dropped.
    pub fn load(&self) -> Result<Vec<LogEntry>> {
        let mut raw = Vec::new();
        let mut file = File::open(&self.path)?;
        file.read_to_end(&mut raw)?;

        let mut entries = Vec::new();
        let mut pos = 0usize;
        while pos + 4 <= raw.len() {
            let len = u32::from_le_bytes(raw[pos..pos + 4].try_into().unwrap()) as usize;
            if pos + 4 + len > raw.len() {
                tracing::warn!("dropping torn trailing log frame");
                break;
            }
            match bincode::deserialize::<LogEntry>(&raw[pos + 4..pos + 4 + len]) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    return Err(ClusterError::Storage(format!("corrupt log frame: {e}")));
                }
            }
            pos += 4 + len;
        }
        Ok(entries)
    }

    /// Rewrite the whole file from the given entries (after truncation or
    /// compaction).
    pub fn rewrite(&mut self, entries: &[LogEntry]) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut out = File::create(&tmp)?;
            for entry in entries {
                let frame = bincode::serialize(entry)?;
                out.write_all(&(frame.len() as u32).to_le_bytes())?;
                out.write_all(&frame)?;
            }
            out.sync_data()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.file = OpenOptions::new()
            .append(true)
            .read(true)
            .open(&self.path)?;
        Ok(())
    }
}

// ============================================================================
// Stable store
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StableState {
    pub current_term: Term,
    pub voted_for: Option<String>,
}

pub struct StableStore {
    path: PathBuf,
}

impl StableStore {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join("stable.json"),
        })
    }

    pub fn load(&self) -> Result<StableState> {
        if !self.path.exists() {
            return Ok(StableState::default());
        }
        let raw = fs::read_to_string(&self.path)?;
        serde_json::from_str(&raw).map_err(|e| ClusterError::Storage(e.to_string()))
    }

    pub fn save(&self, state: &StableState) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        let raw = serde_json::to_string_pretty(state)
            .map_err(|e| ClusterError::Storage(e.to_string()))?;
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// ============================================================================
// Snapshot store
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn open(dir: &Path) -> Result<Self> {
        let dir = dir.join("snapshots");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let path = self
            .dir
            .join(format!("snapshot-{:020}.bin", snapshot.meta.last_included_index));
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bincode::serialize(snapshot)?)?;
        fs::rename(&tmp, &path)?;
        self.prune()?;
        Ok(())
    }

    /// The newest snapshot, if any.
    pub fn latest(&self) -> Result<Option<Snapshot>> {
        let Some(path) = self.snapshot_paths()?.pop() else {
            return Ok(None);
        };
        let raw = fs::read(&path)?;
        let snapshot =
            bincode::deserialize(&raw).map_err(|e| ClusterError::Storage(e.to_string()))?;
        Ok(Some(snapshot))
    }

    fn prune(&self) -> Result<()> {
        let mut paths = self.snapshot_paths()?;
        while paths.len() > SNAPSHOT_RETENTION {
            let oldest = paths.remove(0);
            if let Err(e) = fs::remove_file(&oldest) {
                tracing::warn!(path = %oldest.display(), error = %e, "failed to prune snapshot");
            }
        }
        Ok(())
    }

    /// Snapshot files sorted oldest-first; the zero-padded index in the
    /// name makes lexicographic order the numeric order.
    fn snapshot_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension().map(|x| x == "bin").unwrap_or(false)
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with("snapshot-"))
                        .unwrap_or(false)
            })
            .collect();
        paths.sort();
        Ok(paths)
    }
}
