//! Node-wide orchestration layer.
//!
//! `NodeCore` owns the two node-wide singletons — the WAL writer (C1) and
//! segment writer (C2) — plus the registry of currently hosted groups. It
//! fixes the bootstrap order (WAL writer, then segment writer, then group
//! starts are accepted) and drains in the reverse order on shutdown, the
//! same fixed-phase bring-up/drain discipline a storage engine uses for its
//! buffer pool and I/O workers, generalised here to a multi-group
//! replication node.
//!
//! Out of scope: a CLI, a config-file reader, and process-restart policy.
//! Fatal errors (`RaftError::is_group_fatal`/`is_node_fatal`) are reported
//! on a supervision channel the embedder drains; `NodeCore` itself never
//! restarts anything.

use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::log::Log;
use crate::segment::{SegmentSealed, SegmentWriter};
use crate::snapshot::SnapshotStore;
use crate::types::GroupId;
use crate::wal::record::WalRecord;
use crate::wal::WalWriter;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

/// A fatal condition reported by a hosted group or by one of the node-wide
/// singletons. `NodeCore` only reports these; restart policy is the
/// embedder's concern (a Non-goal of this crate).
#[derive(Debug)]
pub struct SupervisionEvent {
    pub group_id: Option<GroupId>,
    pub error: RaftError,
}

/// One hosted group's node-owned, durable state: its logical log facade
/// and its snapshot store. The group's `RaftServer` and running task are
/// owned by whatever spawned it via [`crate::group::spawn`]; `NodeCore`
/// only keeps the pieces that must outlive any one runtime task (so a
/// group can be stopped and respawned without losing its log or
/// snapshots).
pub struct GroupHandle {
    pub group_id: GroupId,
    pub log: Arc<Log>,
    pub snapshots: Arc<SnapshotStore>,
}

/// Owns the node-wide singletons and the group registry. See the module
/// doc comment for the bootstrap/shutdown ordering contract.
pub struct NodeCore {
    data_dir: PathBuf,
    config: NodeConfig,
    wal: Arc<WalWriter>,
    segments: Arc<SegmentWriter>,
    groups: Arc<DashMap<GroupId, Arc<GroupHandle>>>,
    supervision_tx: mpsc::UnboundedSender<SupervisionEvent>,
    wal_flusher: JoinHandle<()>,
    segment_consumer: JoinHandle<()>,
    segment_router: JoinHandle<()>,
    ready: AtomicBool,
}

impl NodeCore {
    /// Starts the WAL writer (recovering any tail left by a prior crash),
    /// starts the segment writer, and wires the sealed-WAL-file channel
    /// between them. Returns once both singletons are accepting work,
    /// together with the supervision channel's receiving end and every WAL
    /// record recovered from disk — callers replay the latter into each
    /// affected group's [`Log`] via [`Log::append`] before starting that
    /// group, so a restarted node never loses acknowledged-but-unsegmented
    /// writes.
    pub async fn start(data_dir: impl AsRef<Path>, config: NodeConfig) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SupervisionEvent>, Vec<WalRecord>)> {
        config.validate()?;
        let data_dir = data_dir.as_ref().to_path_buf();
        let wal_dir = data_dir.join("wal");
        let segment_dir = data_dir.join("segments");

        let (wal, sealed_rx, recovered) = WalWriter::open(&wal_dir, config.wal.clone())?;
        let wal_flusher = wal.clone().spawn_background_flusher();

        let (segments, segment_notify_rx) = SegmentWriter::new(&segment_dir, config.segment.clone())?;
        let segment_consumer = segments.clone().spawn_consumer(sealed_rx);

        let (supervision_tx, supervision_rx) = mpsc::unbounded_channel();

        let groups: Arc<DashMap<GroupId, Arc<GroupHandle>>> = Arc::new(DashMap::new());
        let segment_router = spawn_segment_router(groups.clone(), segment_notify_rx);

        info!(dir = %data_dir.display(), recovered = recovered.len(), "node core bootstrapped");
        let core = Arc::new(NodeCore {
            data_dir,
            config,
            wal,
            segments,
            groups,
            supervision_tx,
            wal_flusher,
            segment_consumer,
            segment_router,
            ready: AtomicBool::new(true),
        });
        Ok((core, supervision_rx, recovered))
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn wal(&self) -> Arc<WalWriter> {
        self.wal.clone()
    }

    pub fn segments(&self) -> Arc<SegmentWriter> {
        self.segments.clone()
    }

    pub fn report_fatal(&self, group_id: Option<GroupId>, error: RaftError) {
        let _ = self.supervision_tx.send(SupervisionEvent { group_id, error });
    }

    /// Starts hosting `group_id`: allocates its logical log and snapshot
    /// store under the node's data directory, recovering the snapshot
    /// boundary from any previously-promoted snapshot. Idempotent — a
    /// second call for an already-hosted group returns the existing
    /// handle. Since both node-wide singletons are already running by the
    /// time a `NodeCore` exists, this never blocks on their readiness; it
    /// only rejects new starts once the node has begun shutting down.
    pub fn start_group(&self, group_id: GroupId) -> Result<Arc<GroupHandle>> {
        if !self.ready.load(Ordering::Acquire) {
            return Err(RaftError::WalUnavailable);
        }
        if let Some(existing) = self.groups.get(&group_id) {
            return Ok(existing.clone());
        }

        let snapshot_dir = self.data_dir.join("snapshots").join(format!("{:016x}", group_id.0));
        let snapshots = Arc::new(SnapshotStore::open(snapshot_dir)?);
        let log = Arc::new(Log::new(group_id));
        if let Some(meta) = snapshots.live_meta() {
            log.install_snapshot_boundary(meta.last_index, meta.last_term);
        }

        let handle = Arc::new(GroupHandle { group_id, log, snapshots });
        self.groups.insert(group_id, handle.clone());
        Ok(handle)
    }

    pub fn group(&self, group_id: GroupId) -> Option<Arc<GroupHandle>> {
        self.groups.get(&group_id).map(|e| e.clone())
    }

    pub fn stop_group(&self, group_id: GroupId) {
        self.groups.remove(&group_id);
    }

    pub fn hosted_groups(&self) -> Vec<GroupId> {
        self.groups.iter().map(|e| *e.key()).collect()
    }

    /// Drains in the reverse of bootstrap order: stop accepting new group
    /// starts, flush every group's open segment, then flush and stop the
    /// WAL writer. Background singleton tasks are aborted last, once
    /// nothing can enqueue further work for them.
    pub async fn shutdown(&self) -> Result<()> {
        self.ready.store(false, Ordering::Release);
        self.segments.flush_all()?;
        self.wal.shutdown()?;
        self.segment_consumer.abort();
        self.wal_flusher.abort();
        self.segment_router.abort();
        Ok(())
    }
}

/// Forwards every `SegmentSealed` notification to the group it belongs to,
/// releasing that range from the shared hot cache into the segment-index
/// read tier. Spawned once at bootstrap rather than per-group since routing
/// only needs the group registry, not anything owned by a running group's
/// task.
fn spawn_segment_router(groups: Arc<DashMap<GroupId, Arc<GroupHandle>>>, mut notify_rx: mpsc::UnboundedReceiver<SegmentSealed>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(sealed) = notify_rx.recv().await {
            match groups.get(&sealed.group_id) {
                Some(handle) => handle.log.on_segment_sealed(sealed),
                None => tracing::debug!(group_id = ?sealed.group_id, "segment sealed for a group this node no longer hosts"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstraps_and_starts_a_group() {
        let dir = tempfile::tempdir().unwrap();
        let (core, _supervision_rx, recovered) = NodeCore::start(dir.path(), NodeConfig::default()).await.unwrap();
        assert!(recovered.is_empty());

        let group_id = GroupId::new(1);
        let handle = core.start_group(group_id).unwrap();
        assert_eq!(handle.group_id, group_id);
        assert!(core.group(group_id).is_some());

        // Idempotent restart returns the same handle.
        let again = core.start_group(group_id).unwrap();
        assert_eq!(again.log.group_id(), handle.log.group_id());

        core.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn rejects_group_start_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (core, _rx, _recovered) = NodeCore::start(dir.path(), NodeConfig::default()).await.unwrap();
        core.shutdown().await.unwrap();
        let err = core.start_group(GroupId::new(7)).unwrap_err();
        assert!(matches!(err, RaftError::WalUnavailable));
    }
}
