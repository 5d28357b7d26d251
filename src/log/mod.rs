//! Per-group logical log (component C3).
//!
//! Reads resolve across three tiers: an in-memory hot cache for entries not
//! yet in a segment, a segment index for sealed ranges, and a snapshot
//! boundary below which only the snapshot store can answer. The hot cache
//! is one node-wide `DashMap<(GroupId, LogIndex), LogEntry>` keyed by the
//! composite group/index pair, rather than one lock-guarded `HashMap` per
//! group.

use crate::segment::file::SegmentFile;
use crate::segment::SegmentSealed;
use crate::types::{GroupId, LogEntry, LogIndex, Term};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static HOT_CACHE: Lazy<DashMap<(GroupId, LogIndex), LogEntry>> = Lazy::new(DashMap::new);

pub enum Fetch {
    Entry(LogEntry),
    Missing,
    Compacted,
}

struct SegmentRef {
    first_index: LogIndex,
    last_index: LogIndex,
    path: PathBuf,
}

struct LogState {
    segments: BTreeMap<LogIndex, SegmentRef>, // keyed by first_index
    snapshot_last_index: LogIndex,
    snapshot_last_term: Term,
}

/// Per-group facade over the shared WAL/segment singletons and the hot
/// cache, presenting one logical append-only log to the Raft server.
pub struct Log {
    group_id: GroupId,
    state: RwLock<LogState>,
    next_index: AtomicU64,
    truncation_epoch: AtomicU64,
}

impl Log {
    pub fn new(group_id: GroupId) -> Self {
        Log {
            group_id,
            state: RwLock::new(LogState {
                segments: BTreeMap::new(),
                snapshot_last_index: LogIndex::ZERO,
                snapshot_last_term: Term::ZERO,
            }),
            next_index: AtomicU64::new(1),
            truncation_epoch: AtomicU64::new(0),
        }
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn next_index(&self) -> LogIndex {
        LogIndex(self.next_index.load(Ordering::Acquire))
    }

    /// Records an entry that has been enqueued to the WAL writer (durability
    /// is tracked separately via the WAL's `Durable` handle). Visible to
    /// readers immediately so the leader can pipeline replication before
    /// the fsync completes.
    pub fn append(&self, entry: LogEntry) {
        let index = entry.index;
        HOT_CACHE.insert((self.group_id, index), entry);
        self.next_index.fetch_max(index.0 + 1, Ordering::AcqRel);
    }

    pub fn fetch(&self, index: LogIndex) -> Fetch {
        let state = self.state.read();
        if index <= state.snapshot_last_index {
            return Fetch::Compacted;
        }
        if let Some(entry) = HOT_CACHE.get(&(self.group_id, index)) {
            return Fetch::Entry(entry.clone());
        }
        if let Some((_, seg_ref)) = state.segments.range(..=index).next_back() {
            if index <= seg_ref.last_index {
                if let Ok((segment, idx)) = SegmentFile::open_sealed(&seg_ref.path) {
                    if let Some((_, offset)) = idx.iter().find(|(i, _)| *i == index) {
                        if let Ok(record) = segment.read_at(*offset) {
                            return Fetch::Entry(record_to_entry(record));
                        }
                    }
                }
            }
        }
        Fetch::Missing
    }

    pub fn fetch_term(&self, index: LogIndex) -> Option<Term> {
        match self.fetch(index) {
            Fetch::Entry(e) => Some(e.term),
            _ => None,
        }
    }

    pub fn last_index_term(&self) -> (LogIndex, Term) {
        let next = self.next_index();
        if let Some(last) = next.prev() {
            if let Fetch::Entry(e) = self.fetch(last) {
                return (last, e.term);
            }
        }
        let state = self.state.read();
        (state.snapshot_last_index, state.snapshot_last_term)
    }

    /// Overwrites a conflicting suffix starting at `from`. Bumps the
    /// truncation epoch so a stale segment-sealed notification for the
    /// discarded range can be recognised and dropped.
    pub fn truncate_from(&self, from: LogIndex) {
        self.truncation_epoch.fetch_add(1, Ordering::AcqRel);
        let mut index = from;
        loop {
            if HOT_CACHE.remove(&(self.group_id, index)).is_none() {
                // Stop scanning once we run past any entry that might exist;
                // the hot cache only ever holds a bounded recent window so
                // this loop terminates quickly in practice.
                if index.0 > from.0 + 1_000_000 {
                    break;
                }
            }
            index = index.next();
            if index >= self.next_index() {
                break;
            }
        }
        self.next_index.store(from.0, Ordering::Release);
    }

    /// Called by the log owner once the segment writer reports a sealed
    /// range; frees the corresponding hot-cache entries.
    pub fn on_segment_sealed(&self, sealed: SegmentSealed) {
        debug_assert_eq!(sealed.group_id, self.group_id);
        {
            let mut state = self.state.write();
            state.segments.insert(
                sealed.first_index,
                SegmentRef { first_index: sealed.first_index, last_index: sealed.last_index, path: sealed.path },
            );
        }
        let mut idx = sealed.first_index;
        while idx <= sealed.last_index {
            HOT_CACHE.remove(&(self.group_id, idx));
            idx = idx.next();
        }
    }

    /// Only mechanism that physically frees segments: everything with
    /// `last_index < snapshot_idx` becomes eligible for deletion once the
    /// snapshot at or past `snapshot_idx` is durable.
    pub fn update_release_cursor(&self, snapshot_idx: LogIndex, snapshot_term: Term) -> Vec<PathBuf> {
        let mut state = self.state.write();
        state.snapshot_last_index = snapshot_idx;
        state.snapshot_last_term = snapshot_term;
        let stale: Vec<LogIndex> = state
            .segments
            .iter()
            .filter(|(_, s)| s.last_index < snapshot_idx)
            .map(|(first, _)| *first)
            .collect();
        let mut paths = Vec::new();
        for first in stale {
            if let Some(seg) = state.segments.remove(&first) {
                paths.push(seg.path);
            }
        }
        paths
    }

    pub fn install_snapshot_boundary(&self, last_index: LogIndex, last_term: Term) {
        let mut state = self.state.write();
        state.snapshot_last_index = last_index;
        state.snapshot_last_term = last_term;
        state.segments.clear();
        self.next_index.store(last_index.0 + 1, Ordering::Release);
    }

    pub fn snapshot_boundary(&self) -> (LogIndex, Term) {
        let state = self.state.read();
        (state.snapshot_last_index, state.snapshot_last_term)
    }
}

fn record_to_entry(record: crate::wal::record::WalRecord) -> LogEntry {
    use crate::types::EntryKind;
    use crate::wal::record::RecordKind;
    let kind = match record.kind {
        RecordKind::Noop => EntryKind::Noop,
        RecordKind::UserCommand => EntryKind::UserCommand(record.payload),
        RecordKind::ClusterConfig => {
            let (cfg, _) = bincode::decode_from_slice(&record.payload, bincode::config::standard())
                .unwrap_or_else(|_| (crate::types::ClusterConfig { members: vec![] }, 0));
            EntryKind::ClusterConfig(cfg)
        }
    };
    LogEntry { index: record.index, term: record.term, kind, from: None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryKind;

    #[test]
    fn append_then_fetch_hits_hot_cache() {
        let log = Log::new(GroupId::new(99));
        log.append(LogEntry { index: LogIndex(1), term: Term(1), kind: EntryKind::Noop, from: None });
        match log.fetch(LogIndex(1)) {
            Fetch::Entry(e) => assert_eq!(e.term, Term(1)),
            _ => panic!("expected hot cache hit"),
        }
    }

    #[test]
    fn truncate_from_removes_suffix() {
        let log = Log::new(GroupId::new(100));
        for i in 1..=5u64 {
            log.append(LogEntry { index: LogIndex(i), term: Term(1), kind: EntryKind::Noop, from: None });
        }
        log.truncate_from(LogIndex(3));
        assert!(matches!(log.fetch(LogIndex(3)), Fetch::Missing));
        assert!(matches!(log.fetch(LogIndex(2)), Fetch::Entry(_)));
        assert_eq!(log.next_index(), LogIndex(3));
    }

    #[test]
    fn snapshot_boundary_hides_compacted_reads() {
        let log = Log::new(GroupId::new(101));
        log.install_snapshot_boundary(LogIndex(10), Term(2));
        assert!(matches!(log.fetch(LogIndex(5)), Fetch::Compacted));
    }
}
