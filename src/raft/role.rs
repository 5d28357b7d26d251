//! The role state machine. Each variant carries only the state relevant to
//! that role, rather than a single unit-only role tag with side tables for
//! per-role fields.

use crate::types::{LogIndex, NodeAddr, Term};
use std::collections::HashMap;
use std::time::Instant;

#[derive(Clone, Debug)]
pub struct PeerState {
    pub next_index: LogIndex,
    pub match_index: LogIndex,
    pub last_ack: Option<Instant>,
    pub in_flight: bool,
}

impl PeerState {
    pub fn new(next_index: LogIndex) -> Self {
        PeerState { next_index, match_index: LogIndex::ZERO, last_ack: None, in_flight: false }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleKind {
    Follower,
    PreVote,
    Candidate,
    Leader,
    ReceiveSnapshot,
    AwaitCondition,
    TerminatingLeader,
    TerminatingFollower,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MembershipChangeKind {
    Join,
    Leave,
}

#[derive(Clone, Debug)]
pub struct PendingMembershipChange {
    pub kind: MembershipChangeKind,
    pub server: NodeAddr,
    pub started_at: Instant,
    pub timeout: std::time::Duration,
    pub config_index: LogIndex,
}

pub enum Role {
    Follower { leader_id: Option<NodeAddr>, election_deadline: Instant },
    PreVote { election_deadline: Instant, votes: HashMap<NodeAddr, bool> },
    Candidate { election_deadline: Instant, votes: HashMap<NodeAddr, bool> },
    Leader { peers: HashMap<NodeAddr, PeerState>, read_barrier_committed: bool },
    ReceiveSnapshot { leader_id: NodeAddr },
    AwaitCondition { election_deadline: Instant },
    TerminatingLeader,
    TerminatingFollower,
}

impl Role {
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Follower { .. } => RoleKind::Follower,
            Role::PreVote { .. } => RoleKind::PreVote,
            Role::Candidate { .. } => RoleKind::Candidate,
            Role::Leader { .. } => RoleKind::Leader,
            Role::ReceiveSnapshot { .. } => RoleKind::ReceiveSnapshot,
            Role::AwaitCondition { .. } => RoleKind::AwaitCondition,
            Role::TerminatingLeader => RoleKind::TerminatingLeader,
            Role::TerminatingFollower => RoleKind::TerminatingFollower,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader { .. })
    }

    pub fn leader_id(&self) -> Option<NodeAddr> {
        match self {
            Role::Follower { leader_id, .. } => leader_id.clone(),
            Role::ReceiveSnapshot { leader_id } => Some(leader_id.clone()),
            _ => None,
        }
    }
}
