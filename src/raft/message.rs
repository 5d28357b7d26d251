//! Peer wire messages. Encoding is left to the transport; these are the
//! logical fields the protocol requires.

use crate::types::{ClusterConfig, LogEntry, NodeAddr, Term};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesReq {
    pub term: Term,
    pub leader_id: NodeAddr,
    pub prev_index: u64,
    pub prev_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,
    pub last_index: u64,
    pub conflict_term: Option<Term>,
    pub conflict_index: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteReq {
    pub term: Term,
    pub candidate_id: NodeAddr,
    pub last_index: u64,
    pub last_term: Term,
    pub pre_vote: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: Term,
    pub granted: bool,
    pub pre_vote: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotReq {
    pub term: Term,
    pub leader_id: NodeAddr,
    pub last_index: u64,
    pub last_term: Term,
    pub cluster_config: ClusterConfig,
    pub offset: u64,
    pub data: Vec<u8>,
    pub done: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: Term,
    pub last_index: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    AppendEntries(AppendEntriesReq),
    AppendEntriesReply(AppendEntriesReply),
    RequestVote(RequestVoteReq),
    RequestVoteReply(RequestVoteReply),
    InstallSnapshot(InstallSnapshotReq),
    InstallSnapshotReply(InstallSnapshotReply),
}

impl Message {
    pub fn term(&self) -> Term {
        match self {
            Message::AppendEntries(m) => m.term,
            Message::AppendEntriesReply(m) => m.term,
            Message::RequestVote(m) => m.term,
            Message::RequestVoteReply(m) => m.term,
            Message::InstallSnapshot(m) => m.term,
            Message::InstallSnapshotReply(m) => m.term,
        }
    }
}
