//! Error taxonomy for the replication core.
//!
//! Each variant maps to exactly one recovery policy. `BadTerm` is handled
//! internally by role-transition logic and should not normally cross the
//! public propose/apply boundary, but is kept as a variant because it is
//! still constructed and logged at the point of transition.

use crate::types::{GroupId, LogIndex, NodeAddr};

#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("not leader (hint: {hint:?})")]
    NotLeader { hint: Option<NodeAddr> },

    #[error("leader unknown")]
    LeaderUnknown,

    #[error("operation timed out")]
    Timeout,

    #[error("a membership change is already in progress")]
    ClusterChangeInProgress,

    #[error("stale term")]
    BadTerm,

    #[error("requested index {requested:?} is not contiguous with next index {expected:?}")]
    IndexGap { requested: LogIndex, expected: LogIndex },

    #[error("log corrupt for group {0:?}")]
    LogCorrupt(GroupId),

    #[error("WAL unavailable, node aborting")]
    WalUnavailable,

    #[error("snapshot unavailable")]
    SnapshotUnavailable,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RaftError {
    /// Fatal to the owning group: the group must be torn down.
    pub fn is_group_fatal(&self) -> bool {
        matches!(self, RaftError::LogCorrupt(_))
    }

    /// Fatal to the whole node.
    pub fn is_node_fatal(&self) -> bool {
        matches!(self, RaftError::WalUnavailable)
    }
}

impl From<bincode::error::EncodeError> for RaftError {
    fn from(e: bincode::error::EncodeError) -> Self {
        RaftError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for RaftError {
    fn from(e: bincode::error::DecodeError) -> Self {
        RaftError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;
