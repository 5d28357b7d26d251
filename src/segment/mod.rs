//! Node-wide singleton segment writer (component C2).
//!
//! Consumes sealed WAL files strictly in seal order, demultiplexes records
//! by group into a `DashMap<GroupId, OpenSegment>` of per-group open file
//! handles, and notifies each group of its new segment range. Per-group
//! append order is preserved; distinct groups within one WAL file are
//! appended in parallel via a `rayon` scope.

pub mod file;

use crate::config::SegmentConfig;
use crate::error::Result;
use crate::types::{GroupId, LogIndex};
use crate::wal::record::WalRecord;
use crate::wal::SealedWalFile;
use dashmap::DashMap;
use file::SegmentFile;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Notification emitted to a group when a new segment covering part of its
/// log becomes available.
#[derive(Clone, Debug)]
pub struct SegmentSealed {
    pub group_id: GroupId,
    pub path: PathBuf,
    pub first_index: LogIndex,
    pub last_index: LogIndex,
}

struct OpenSegment {
    file: SegmentFile,
    generation: u64,
}

pub struct SegmentWriter {
    root: PathBuf,
    config: SegmentConfig,
    open: DashMap<GroupId, OpenSegment>,
    next_generation: DashMap<GroupId, u64>,
    notify_tx: mpsc::UnboundedSender<SegmentSealed>,
}

impl SegmentWriter {
    pub fn new(
        root: impl Into<PathBuf>,
        config: SegmentConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SegmentSealed>)> {
        config.validate()?;
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Ok((
            Arc::new(SegmentWriter {
                root,
                config,
                open: DashMap::new(),
                next_generation: DashMap::new(),
                notify_tx,
            }),
            notify_rx,
        ))
    }

    fn group_dir(&self, group_id: GroupId) -> PathBuf {
        self.root.join(format!("{:016x}", group_id.0))
    }

    fn open_segment_for(&self, group_id: GroupId) -> Result<()> {
        if self.open.contains_key(&group_id) {
            return Ok(());
        }
        let dir = self.group_dir(group_id);
        std::fs::create_dir_all(&dir)?;
        let generation = {
            let mut gen_entry = self.next_generation.entry(group_id).or_insert(0);
            let g = *gen_entry;
            *gen_entry += 1;
            g
        };
        let path = dir.join(format!("{generation:020}.segment"));
        let file = SegmentFile::create(&path)?;
        self.open.insert(group_id, OpenSegment { file, generation });
        Ok(())
    }

    fn append_one(&self, record: &WalRecord) -> Result<()> {
        self.open_segment_for(record.group_id)?;
        let should_seal = {
            let mut entry = self.open.get_mut(&record.group_id).unwrap();
            entry.file.append(record)?;
            entry.file.bytes_written >= self.config.rollover_size_bytes
                || entry.file.entry_count() as u64 >= self.config.rollover_index_span
        };
        if should_seal {
            self.seal_group(record.group_id)?;
        }
        Ok(())
    }

    /// Fsyncs a group's still-open segment so far. A no-op if the group has
    /// no open segment (its last append rolled it over, which `seal_group`
    /// already fsyncs as part of writing the footer).
    fn sync_open_segment(&self, group_id: GroupId) -> Result<()> {
        if let Some(mut entry) = self.open.get_mut(&group_id) {
            entry.file.sync()?;
        }
        Ok(())
    }

    fn seal_group(&self, group_id: GroupId) -> Result<()> {
        if let Some((_, mut open)) = self.open.remove(&group_id) {
            open.file.seal()?;
            let notification = SegmentSealed {
                group_id,
                path: open.file.path.clone(),
                first_index: open.file.first_index.unwrap_or(LogIndex::ZERO),
                last_index: open.file.last_index.unwrap_or(LogIndex::ZERO),
            };
            if self.notify_tx.send(notification).is_err() {
                warn!(?group_id, "no log consumer for segment-sealed notification");
            }
        }
        Ok(())
    }

    /// Processes one sealed WAL file end to end: decode, demux, append,
    /// optionally seal, then delete the WAL file once every touched group
    /// has had its append durably flushed to its segment.
    pub fn process_sealed_wal_file(&self, sealed: &SealedWalFile) -> Result<()> {
        let mut raw = Vec::new();
        std::fs::File::open(&sealed.path)?.read_to_end(&mut raw)?;

        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset < raw.len() {
            match WalRecord::decode(&raw[offset..])? {
                Some((record, consumed)) => {
                    records.push(record);
                    offset += consumed;
                }
                None => break, // partial tail record, e.g. from a crash; ignore
            }
        }

        // Group-preserving demux: bucket first so rayon can fan out across
        // groups while each bucket retains strict arrival order.
        let mut by_group: std::collections::HashMap<GroupId, Vec<WalRecord>> = std::collections::HashMap::new();
        for record in records {
            by_group.entry(record.group_id).or_default().push(record);
        }

        let results: Vec<Result<()>> = {
            use rayon::prelude::*;
            by_group
                .into_par_iter()
                .map(|(group_id, group_records)| {
                    for record in &group_records {
                        self.append_one(record)?;
                    }
                    // Fsync the touched segment now, even if it didn't hit a
                    // rollover threshold, so the WAL file below is only
                    // deleted once every record in it is durable somewhere.
                    self.sync_open_segment(group_id)?;
                    Ok(())
                })
                .collect()
        };
        for r in results {
            r?;
        }

        std::fs::remove_file(&sealed.path)?;
        debug!(path = %sealed.path.display(), "sealed WAL file demuxed and removed");
        Ok(())
    }

    /// Spawns the background task draining sealed WAL files in strict order.
    pub fn spawn_consumer(self: Arc<Self>, mut sealed_rx: mpsc::UnboundedReceiver<SealedWalFile>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(sealed) = sealed_rx.recv().await {
                let writer = self.clone();
                let path_for_log = sealed.path.clone();
                let res = tokio::task::spawn_blocking(move || writer.process_sealed_wal_file(&sealed)).await;
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, path = %path_for_log.display(), "failed to process sealed WAL file"),
                    Err(e) => warn!(error = %e, "segment writer task panicked"),
                }
            }
            info!("segment writer consumer exiting: sealed-file channel closed");
        })
    }

    pub fn flush_all(&self) -> Result<()> {
        let group_ids: Vec<GroupId> = self.open.iter().map(|e| *e.key()).collect();
        for group_id in group_ids {
            self.seal_group(group_id)?;
        }
        Ok(())
    }
}
