//! Per-group snapshot store (component C4).
//!
//! Directory-per-snapshot layout with a JSON metadata sidecar and a
//! fsync-then-promote discipline, extended with an explicit checkpoint/live
//! distinction: a checkpoint is a snapshot written and fsynced but not yet
//! authorising segment deletion; only `promote` makes it live.

use crate::error::Result;
use crate::types::{ClusterConfig, LogIndex, Term};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_index: LogIndex,
    pub last_term: Term,
    pub cluster_config: ClusterConfig,
    pub created_at_epoch_ms: u64,
}

/// A written-and-fsynced snapshot not yet promoted to live.
pub struct Checkpoint {
    pub meta: SnapshotMeta,
    dir: PathBuf,
}

pub struct SnapshotStore {
    root: PathBuf,
    pending_checkpoint: parking_lot::Mutex<Option<SnapshotMeta>>,
    live: parking_lot::Mutex<Option<SnapshotMeta>>,
}

impl SnapshotStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let live = load_live_meta(&root)?;
        Ok(SnapshotStore { root, pending_checkpoint: parking_lot::Mutex::new(None), live: parking_lot::Mutex::new(live) })
    }

    fn snapshot_dir(&self, meta: &SnapshotMeta) -> PathBuf {
        self.root.join(format!("{}-{}", meta.last_index.0, meta.last_term.0))
    }

    /// Writes and fsyncs a new snapshot as a checkpoint. Does not touch the
    /// live pointer; a previously-pending, never-promoted checkpoint is
    /// discarded.
    pub fn write_checkpoint(&self, last_index: LogIndex, last_term: Term, cluster_config: ClusterConfig, state_bytes: &[u8]) -> Result<Checkpoint> {
        let meta = SnapshotMeta {
            last_index,
            last_term,
            cluster_config,
            created_at_epoch_ms: 0,
        };
        let dir = self.snapshot_dir(&meta);
        std::fs::create_dir_all(&dir)?;

        let data_path = dir.join("data");
        std::fs::write(&data_path, state_bytes)?;
        std::fs::File::open(&data_path)?.sync_all()?;

        let meta_path = dir.join("meta.json");
        let meta_json = serde_json::to_string_pretty(&meta).map_err(|e| crate::error::RaftError::Serialization(e.to_string()))?;
        std::fs::write(&meta_path, meta_json)?;
        std::fs::File::open(&meta_path)?.sync_all()?;

        if let Some(previous) = self.pending_checkpoint.lock().replace(meta.clone()) {
            // A superseded, never-promoted checkpoint authorises nothing;
            // its files are simply removed.
            let stale_dir = self.snapshot_dir(&previous);
            let _ = std::fs::remove_dir_all(stale_dir);
        }

        Ok(Checkpoint { meta, dir })
    }

    /// Promotes the most recently written checkpoint to live. Returns the
    /// now-superseded live snapshot's metadata, if any, so the caller can
    /// tell the log's release cursor to advance past it.
    pub fn promote(&self, checkpoint: Checkpoint) -> Result<Option<SnapshotMeta>> {
        {
            let mut pending = self.pending_checkpoint.lock();
            match pending.as_ref() {
                Some(m) if m.last_index == checkpoint.meta.last_index && m.last_term == checkpoint.meta.last_term => {
                    *pending = None;
                }
                _ => {
                    return Err(crate::error::RaftError::SnapshotUnavailable);
                }
            }
        }
        let promoted_path = self.root.join("LIVE");
        std::fs::write(&promoted_path, checkpoint.dir.file_name().unwrap().to_string_lossy().as_bytes())?;
        std::fs::File::open(&promoted_path)?.sync_all()?;

        let previous = self.live.lock().replace(checkpoint.meta.clone());
        Ok(previous)
    }

    pub fn discard(&self, checkpoint: Checkpoint) -> Result<()> {
        let mut pending = self.pending_checkpoint.lock();
        if pending.as_ref().map(|m| m.last_index) == Some(checkpoint.meta.last_index) {
            *pending = None;
        }
        std::fs::remove_dir_all(&checkpoint.dir)?;
        Ok(())
    }

    pub fn recover(&self) -> Result<Option<(SnapshotMeta, Vec<u8>)>> {
        let live = self.live.lock().clone();
        let Some(meta) = live else { return Ok(None) };
        let dir = self.snapshot_dir(&meta);
        let data = std::fs::read(dir.join("data"))?;
        Ok(Some((meta, data)))
    }

    pub fn live_meta(&self) -> Option<SnapshotMeta> {
        self.live.lock().clone()
    }

    /// Receiver side of a peer-streamed install: writes chunks to a staging
    /// file, then on `done` finalises it as a checkpoint and promotes it.
    pub fn install_chunk(&self, last_index: LogIndex, last_term: Term, offset: u64, data: &[u8], done: bool, cluster_config: ClusterConfig) -> Result<Option<SnapshotMeta>> {
        let staging_dir = self.root.join("staging");
        std::fs::create_dir_all(&staging_dir)?;
        let staging_path = staging_dir.join(format!("{}-{}", last_index.0, last_term.0));
        use std::io::{Seek, SeekFrom, Write};
        let mut f = std::fs::OpenOptions::new().create(true).write(true).open(&staging_path)?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(data)?;
        f.flush()?;
        if !done {
            return Ok(None);
        }
        f.sync_all()?;
        let bytes = std::fs::read(&staging_path)?;
        let checkpoint = self.write_checkpoint(last_index, last_term, cluster_config, &bytes)?;
        std::fs::remove_file(&staging_path).ok();
        self.promote(checkpoint)
    }
}

fn load_live_meta(root: &Path) -> Result<Option<SnapshotMeta>> {
    let pointer_path = root.join("LIVE");
    if !pointer_path.exists() {
        return Ok(None);
    }
    let dir_name = std::fs::read_to_string(&pointer_path)?;
    let meta_path = root.join(dir_name.trim()).join("meta.json");
    if !meta_path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&meta_path)?;
    let meta: SnapshotMeta = serde_json::from_str(&content).map_err(|e| crate::error::RaftError::Serialization(e.to_string()))?;
    Ok(Some(meta))
}
