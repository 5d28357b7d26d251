//! Core identifiers and wire-level value types shared by every component.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque group identifier. Stable for the lifetime of the group.
///
/// Represented as a bare `u64` rather than a wider type so that it fits the
/// WAL record header's `group_hash` field directly: the wire value *is* the
/// group identity, not a lossy hash of some richer id, so the segment writer
/// can demultiplex records without a side (hash -> id) table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u64);

impl GroupId {
    pub fn new(id: u64) -> Self {
        GroupId(id)
    }

    pub fn random() -> Self {
        GroupId(uuid::Uuid::new_v4().as_u64_pair().0)
    }

    /// Value stored in the WAL record header's `group_hash` field.
    pub fn hash64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({:016x})", self.0)
    }
}

/// Network-reachable address of a server hosting one replica of a group.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddr(pub String);

impl NodeAddr {
    pub fn new(s: impl Into<String>) -> Self {
        NodeAddr(s.into())
    }
}

impl fmt::Debug for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A specific replica: which group, hosted at which address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId {
    pub group: GroupId,
    pub addr: NodeAddr,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }

    pub fn prev(self) -> Option<LogIndex> {
        self.0.checked_sub(1).map(LogIndex)
    }
}

impl fmt::Debug for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

/// Cluster membership as recorded in a config log entry.
///
/// Membership changes in this design are single-server (add or remove one
/// member at a time), never joint consensus: the member set simply takes
/// effect at append time, backed by the leader's pending-change bookkeeping
/// in the Raft server rather than a joint (old, new) pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ClusterConfig {
    pub members: Vec<ConfigMember>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ConfigMember {
    pub addr: String,
}

impl ClusterConfig {
    pub fn new(members: impl IntoIterator<Item = NodeAddr>) -> Self {
        ClusterConfig {
            members: members.into_iter().map(|a| ConfigMember { addr: a.0 }).collect(),
        }
    }

    pub fn addrs(&self) -> impl Iterator<Item = NodeAddr> + '_ {
        self.members.iter().map(|m| NodeAddr(m.addr.clone()))
    }

    pub fn contains(&self, addr: &NodeAddr) -> bool {
        self.members.iter().any(|m| m.addr == addr.0)
    }

    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn with_added(&self, addr: NodeAddr) -> Self {
        let mut members = self.members.clone();
        if !self.contains(&addr) {
            members.push(ConfigMember { addr: addr.0 });
        }
        ClusterConfig { members }
    }

    pub fn with_removed(&self, addr: &NodeAddr) -> Self {
        ClusterConfig {
            members: self.members.iter().filter(|m| m.addr != addr.0).cloned().collect(),
        }
    }
}

/// Why a log entry exists. Only `UserCommand` payloads are opaque to the
/// core; `ClusterConfig` and `Noop` are interpreted by the Raft server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EntryKind {
    UserCommand(Vec<u8>),
    ClusterConfig(ClusterConfig),
    Noop,
}

/// A single entry in a group's replicated log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub kind: EntryKind,
    /// Correlates a proposal to its eventual reply; absent for entries the
    /// core itself generates (noop, config reverts).
    pub from: Option<RequestId>,
}

/// Opaque correlation handle for a client proposal, carried through to the
/// apply loop's `notify` effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// Metadata handed to the user state machine's `apply` callback.
#[derive(Clone, Debug)]
pub struct ApplyMeta {
    pub index: LogIndex,
    pub term: Term,
    pub system_time: std::time::SystemTime,
    pub from: Option<RequestId>,
}

/// Reason a pending membership change reverted instead of completing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipRevertReason {
    VerificationTimeout,
    Unreachable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_config_quorum() {
        let cfg = ClusterConfig::new([NodeAddr::new("a"), NodeAddr::new("b"), NodeAddr::new("c")]);
        assert_eq!(cfg.quorum_size(), 2);
    }

    #[test]
    fn cluster_config_add_remove() {
        let cfg = ClusterConfig::new([NodeAddr::new("a"), NodeAddr::new("b")]);
        let added = cfg.with_added(NodeAddr::new("c"));
        assert_eq!(added.members.len(), 3);
        let removed = added.with_removed(&NodeAddr::new("b"));
        assert_eq!(removed.members.len(), 2);
        assert!(!removed.contains(&NodeAddr::new("b")));
    }

    #[test]
    fn group_id_hash_stable() {
        let g = GroupId::new(42);
        assert_eq!(g.hash64(), g.hash64());
    }
}
