//! Per-group Raft server (component C5).
//!
//! Persistent/volatile state split with `next_index`/`match_index`
//! replication bookkeeping and fast-rollback via conflict hints, extended
//! with an eight-role set, a pre-vote extension, and single-server
//! membership change with a verification timer and automatic revert
//! (single-server rather than joint consensus). The server is a pure
//! function of `(state, event) -> outcome`; all I/O (WAL append, network
//! send) is performed by the caller acting on the returned [`Outcome`].

pub mod message;
pub mod role;

use crate::config::{MembershipConfig, RaftTimingConfig};
use crate::error::{RaftError, Result};
use crate::log::{Fetch, Log};
use crate::types::{ClusterConfig, EntryKind, GroupId, LogEntry, LogIndex, MembershipRevertReason, NodeAddr, RequestId, Term};
use message::*;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use role::{MembershipChangeKind, PeerState, PendingMembershipChange, Role, RoleKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug)]
pub enum Event {
    Tick(Instant),
    Peer(NodeAddr, Message),
    ClientCommand { command: Vec<u8>, from: Option<RequestId> },
    Join { server: NodeAddr, from: Option<RequestId> },
    Leave { server: NodeAddr, from: Option<RequestId> },
    WalDurable(LogIndex),
    SegmentSealed(crate::segment::SegmentSealed),
    LivenessChanged(NodeAddr, crate::liveness::Liveness),
    Terminate,
}

#[derive(Default, Debug)]
pub struct Outcome {
    pub outbound: Vec<(NodeAddr, Message)>,
    /// Entries the caller must hand to the WAL writer, in order.
    pub log_writes: Vec<LogEntry>,
    pub membership_notification: Option<(NodeAddr, MembershipRevertReason)>,
    pub proposal_error: Option<RaftError>,
}

/// An append-entries success reply this node owes a leader, withheld until
/// `durable_index` catches up to `index` so a reply never claims durability
/// the WAL writer hasn't actually fsynced yet.
#[derive(Clone, Debug)]
struct PendingDurableAck {
    to: NodeAddr,
    term: Term,
    index: LogIndex,
}

pub struct RaftServer {
    pub group_id: GroupId,
    pub self_addr: NodeAddr,
    role: Role,
    current_term: Term,
    voted_for: Option<NodeAddr>,
    log: Arc<Log>,
    cluster_config: ClusterConfig,
    commit_index: LogIndex,
    /// Highest index this node's own WAL writer has fsynced a batch
    /// through. Gates both this node's own append-entries replies and,
    /// while leader, its own contribution to the commit-index quorum.
    durable_index: LogIndex,
    pending_durable_ack: Option<PendingDurableAck>,
    pending_membership_change: Option<PendingMembershipChange>,
    rng: StdRng,
    timing: RaftTimingConfig,
    membership_cfg: MembershipConfig,
    last_membership_tick: Instant,
}

impl RaftServer {
    pub fn new(
        group_id: GroupId,
        self_addr: NodeAddr,
        log: Arc<Log>,
        cluster_config: ClusterConfig,
        timing: RaftTimingConfig,
        membership_cfg: MembershipConfig,
        rng_seed: u64,
    ) -> Self {
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(rng_seed);
        let deadline = now + random_election_timeout(&mut rng, &timing);
        RaftServer {
            group_id,
            self_addr,
            role: Role::Follower { leader_id: None, election_deadline: deadline },
            current_term: Term::ZERO,
            voted_for: None,
            log,
            cluster_config,
            commit_index: LogIndex::ZERO,
            durable_index: LogIndex::ZERO,
            pending_durable_ack: None,
            pending_membership_change: None,
            rng,
            timing,
            membership_cfg,
            last_membership_tick: now,
        }
    }

    pub fn role_kind(&self) -> RoleKind {
        self.role.kind()
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn leader_hint(&self) -> Option<NodeAddr> {
        self.role.leader_id()
    }

    fn peers(&self) -> Vec<NodeAddr> {
        self.cluster_config.addrs().filter(|a| *a != self.self_addr).collect()
    }

    fn quorum_size(&self) -> usize {
        self.cluster_config.quorum_size()
    }

    fn new_election_deadline(&mut self) -> Instant {
        Instant::now() + random_election_timeout(&mut self.rng, &self.timing)
    }

    fn become_follower(&mut self, term: Term, leader_id: Option<NodeAddr>) {
        if term > self.current_term {
            self.voted_for = None;
        }
        self.current_term = term;
        let deadline = self.new_election_deadline();
        self.role = Role::Follower { leader_id, election_deadline: deadline };
    }

    pub fn handle(&mut self, event: Event) -> Outcome {
        match event {
            Event::Tick(now) => self.on_tick(now),
            Event::Peer(from, msg) => self.on_peer_message(from, msg),
            Event::ClientCommand { command, from } => self.on_client_command(command, from),
            Event::Join { server, from } => self.begin_membership_change(MembershipChangeKind::Join, server, from),
            Event::Leave { server, from } => self.begin_membership_change(MembershipChangeKind::Leave, server, from),
            Event::WalDurable(index) => self.on_wal_durable(index),
            Event::SegmentSealed(sealed) => {
                self.log.on_segment_sealed(sealed);
                Outcome::default()
            }
            Event::LivenessChanged(..) => Outcome::default(),
            Event::Terminate => {
                self.role = if self.role.is_leader() { Role::TerminatingLeader } else { Role::TerminatingFollower };
                Outcome::default()
            }
        }
    }

    // ---- tick / elections ----------------------------------------------

    fn on_tick(&mut self, now: Instant) -> Outcome {
        let mut outcome = Outcome::default();
        match &self.role {
            Role::Follower { election_deadline, .. } | Role::AwaitCondition { election_deadline } if now >= *election_deadline => {
                self.start_pre_vote(&mut outcome);
            }
            Role::PreVote { election_deadline, .. } | Role::Candidate { election_deadline, .. } if now >= *election_deadline => {
                self.start_pre_vote(&mut outcome);
            }
            Role::Leader { .. } => {
                self.broadcast_append_entries(&mut outcome);
                self.check_membership_timer(now, &mut outcome);
            }
            _ => {}
        }
        outcome
    }

    fn start_pre_vote(&mut self, outcome: &mut Outcome) {
        let deadline = self.new_election_deadline();
        let (last_index, last_term) = self.log.last_index_term();
        self.role = Role::PreVote { election_deadline: deadline, votes: HashMap::new() };
        for peer in self.peers() {
            outcome.outbound.push((
                peer,
                Message::RequestVote(RequestVoteReq {
                    term: self.current_term.next(),
                    candidate_id: self.self_addr.clone(),
                    last_index: last_index.0,
                    last_term,
                    pre_vote: true,
                }),
            ));
        }
        if self.quorum_size() == 1 {
            // Single-member group: the pre-vote reply loop never fires, so
            // unlock the real election immediately.
            self.start_election(outcome);
        }
    }

    fn start_election(&mut self, outcome: &mut Outcome) {
        self.current_term = self.current_term.next();
        self.voted_for = Some(self.self_addr.clone());
        let deadline = self.new_election_deadline();
        let mut votes = HashMap::new();
        votes.insert(self.self_addr.clone(), true);
        self.role = Role::Candidate { election_deadline: deadline, votes };
        let (last_index, last_term) = self.log.last_index_term();
        info!(group = ?self.group_id, term = ?self.current_term, "starting election");
        for peer in self.peers() {
            outcome.outbound.push((
                peer,
                Message::RequestVote(RequestVoteReq {
                    term: self.current_term,
                    candidate_id: self.self_addr.clone(),
                    last_index: last_index.0,
                    last_term,
                    pre_vote: false,
                }),
            ));
        }
        if self.quorum_size() == 1 {
            self.become_leader(outcome);
        }
    }

    fn become_leader(&mut self, outcome: &mut Outcome) {
        let next_index = self.log.next_index();
        let peers = self.peers().into_iter().map(|p| (p, PeerState::new(next_index))).collect();
        self.role = Role::Leader { peers, read_barrier_committed: false };
        info!(group = ?self.group_id, term = ?self.current_term, "became leader");

        let noop = LogEntry { index: next_index, term: self.current_term, kind: EntryKind::Noop, from: None };
        self.log.append(noop.clone());
        outcome.log_writes.push(noop);
        self.broadcast_append_entries(outcome);
    }

    // ---- replication -----------------------------------------------------

    fn broadcast_append_entries(&mut self, outcome: &mut Outcome) {
        let term = self.current_term;
        let commit_index = self.commit_index;
        let max_batch = self.timing.max_entries_per_append;
        let Role::Leader { peers, .. } = &mut self.role else { return };
        for (peer_addr, peer_state) in peers.iter_mut() {
            let prev_index = peer_state.next_index.prev().unwrap_or(LogIndex::ZERO);
            let prev_term = if prev_index == LogIndex::ZERO { Term::ZERO } else { self.log.fetch_term(prev_index).unwrap_or(Term::ZERO) };

            let mut entries = Vec::new();
            let mut idx = peer_state.next_index;
            while entries.len() < max_batch {
                match self.log.fetch(idx) {
                    Fetch::Entry(e) => {
                        entries.push(e);
                        idx = idx.next();
                    }
                    _ => break,
                }
            }

            outcome.outbound.push((
                peer_addr.clone(),
                Message::AppendEntries(AppendEntriesReq {
                    term,
                    leader_id: self.self_addr.clone(),
                    prev_index: prev_index.0,
                    prev_term,
                    entries,
                    leader_commit: commit_index.0,
                }),
            ));
            peer_state.in_flight = true;
        }
    }

    fn recalculate_commit_index(&mut self) {
        let Role::Leader { peers, .. } = &self.role else { return };
        let mut match_indices: Vec<LogIndex> = peers.values().map(|p| p.match_index).collect();
        match_indices.push(self.durable_index); // self: only count what we've actually fsynced
        match_indices.sort();
        let quorum = self.quorum_size();
        if match_indices.len() < quorum {
            return;
        }
        let candidate = match_indices[match_indices.len() - quorum];
        if candidate > self.commit_index {
            if let Some(term) = self.log.fetch_term(candidate) {
                if term == self.current_term {
                    self.commit_index = candidate;
                }
            }
        }
    }

    /// Called whenever this node's durable frontier advances: resends any
    /// append-entries reply that was withheld pending durability, and
    /// re-evaluates the commit index and a pending `Leave` completion since
    /// both can depend on this node's own durable progress (notably in a
    /// single-member group, where there are no peers to ack at all).
    fn on_wal_durable(&mut self, index: LogIndex) -> Outcome {
        let mut outcome = Outcome::default();
        if index > self.durable_index {
            self.durable_index = index;
        }
        if let Some(pending) = self.pending_durable_ack.clone() {
            if pending.term == self.current_term && self.durable_index >= pending.index {
                outcome.outbound.push((
                    pending.to,
                    Message::AppendEntriesReply(AppendEntriesReply {
                        term: self.current_term,
                        success: true,
                        last_index: pending.index.0,
                        conflict_term: None,
                        conflict_index: None,
                    }),
                ));
                self.pending_durable_ack = None;
            }
        }
        self.recalculate_commit_index();
        self.check_pending_leave_completion();
        outcome
    }

    /// A pending `Leave` has no peer left to ack it (the departing server
    /// was already removed from `peers`), so it completes on commit of its
    /// own config entry rather than on any reply.
    fn check_pending_leave_completion(&mut self) {
        if let Some(pending) = &self.pending_membership_change {
            if pending.kind == MembershipChangeKind::Leave && self.commit_index >= pending.config_index {
                self.pending_membership_change = None;
            }
        }
    }

    // ---- peer message dispatch -------------------------------------------

    fn on_peer_message(&mut self, from: NodeAddr, msg: Message) -> Outcome {
        let mut outcome = Outcome::default();
        if msg.term() > self.current_term {
            self.become_follower(msg.term(), None);
        }
        match msg {
            Message::RequestVote(req) => self.on_request_vote(from, req, &mut outcome),
            Message::RequestVoteReply(reply) => self.on_request_vote_reply(from, reply, &mut outcome),
            Message::AppendEntries(req) => self.on_append_entries(from, req, &mut outcome),
            Message::AppendEntriesReply(reply) => self.on_append_entries_reply(from, reply, &mut outcome),
            Message::InstallSnapshot(req) => self.on_install_snapshot(from, req, &mut outcome),
            Message::InstallSnapshotReply(reply) => self.on_install_snapshot_reply(from, reply, &mut outcome),
        }
        outcome
    }

    fn on_request_vote(&mut self, from: NodeAddr, req: RequestVoteReq, outcome: &mut Outcome) {
        let (our_last_index, our_last_term) = self.log.last_index_term();
        let log_ok = req.last_term > our_last_term || (req.last_term == our_last_term && req.last_index >= our_last_index.0);
        let recently_heard_from_leader = matches!(&self.role, Role::Follower { leader_id: Some(_), .. });

        let granted = if req.pre_vote {
            log_ok && !recently_heard_from_leader
        } else {
            req.term >= self.current_term
                && log_ok
                && (self.voted_for.is_none() || self.voted_for.as_ref() == Some(&req.candidate_id))
        };

        if granted && !req.pre_vote {
            self.voted_for = Some(req.candidate_id.clone());
            self.current_term = req.term;
        }

        outcome.outbound.push((from, Message::RequestVoteReply(RequestVoteReply { term: self.current_term, granted, pre_vote: req.pre_vote })));
    }

    fn on_request_vote_reply(&mut self, from: NodeAddr, reply: RequestVoteReply, outcome: &mut Outcome) {
        if reply.pre_vote {
            if let Role::PreVote { votes, .. } = &mut self.role {
                votes.insert(from, reply.granted);
                let granted_count = votes.values().filter(|v| **v).count() + 1; // + self
                if granted_count >= self.quorum_size() {
                    self.start_election(outcome);
                }
            }
            return;
        }
        if let Role::Candidate { votes, .. } = &mut self.role {
            if reply.term == self.current_term {
                votes.insert(from, reply.granted);
                let granted_count = votes.values().filter(|v| **v).count();
                if granted_count >= self.quorum_size() {
                    self.become_leader(outcome);
                }
            }
        }
    }

    fn on_append_entries(&mut self, from: NodeAddr, req: AppendEntriesReq, outcome: &mut Outcome) {
        if req.term < self.current_term {
            outcome.outbound.push((
                from,
                Message::AppendEntriesReply(AppendEntriesReply { term: self.current_term, success: false, last_index: 0, conflict_term: None, conflict_index: None }),
            ));
            return;
        }
        self.become_follower(req.term, Some(from.clone()));

        let prev_index = LogIndex(req.prev_index);
        if prev_index != LogIndex::ZERO {
            match self.log.fetch(prev_index) {
                Fetch::Entry(e) if e.term == req.prev_term => {}
                Fetch::Compacted => {}
                Fetch::Entry(e) => {
                    let conflict_term = Some(e.term);
                    let conflict_index = self.first_index_of_term(e.term);
                    outcome.outbound.push((
                        from,
                        Message::AppendEntriesReply(AppendEntriesReply { term: self.current_term, success: false, last_index: 0, conflict_term, conflict_index }),
                    ));
                    return;
                }
                Fetch::Missing => {
                    let (our_last, _) = self.log.last_index_term();
                    outcome.outbound.push((
                        from,
                        Message::AppendEntriesReply(AppendEntriesReply { term: self.current_term, success: false, last_index: 0, conflict_term: None, conflict_index: Some(our_last.0 + 1) }),
                    ));
                    return;
                }
            }
        }

        let mut last_new_index = prev_index;
        for entry in req.entries {
            if let Some(existing_term) = self.log.fetch_term(entry.index) {
                if existing_term != entry.term {
                    self.log.truncate_from(entry.index);
                } else {
                    last_new_index = entry.index;
                    continue;
                }
            }
            if let EntryKind::ClusterConfig(ref cfg) = entry.kind {
                self.cluster_config = cfg.clone();
            }
            self.log.append(entry.clone());
            outcome.log_writes.push(entry.clone());
            last_new_index = entry.index;
        }

        if req.leader_commit > self.commit_index.0 {
            self.commit_index = LogIndex(req.leader_commit.min(last_new_index.0));
        }

        if last_new_index <= self.durable_index {
            outcome.outbound.push((
                from,
                Message::AppendEntriesReply(AppendEntriesReply { term: self.current_term, success: true, last_index: last_new_index.0, conflict_term: None, conflict_index: None }),
            ));
            self.pending_durable_ack = None;
        } else {
            // Don't ack past what our own WAL writer has fsynced yet; the
            // reply goes out once `on_wal_durable` observes the fsync.
            self.pending_durable_ack = Some(PendingDurableAck { to: from, term: self.current_term, index: last_new_index });
        }
    }

    fn first_index_of_term(&self, term: Term) -> Option<u64> {
        let (mut idx, _) = self.log.last_index_term();
        let mut result = None;
        while idx > LogIndex::ZERO {
            match self.log.fetch(idx) {
                Fetch::Entry(e) if e.term == term => {
                    result = Some(idx.0);
                    idx = idx.prev().unwrap_or(LogIndex::ZERO);
                }
                _ => break,
            }
        }
        result
    }

    fn on_append_entries_reply(&mut self, from: NodeAddr, reply: AppendEntriesReply, outcome: &mut Outcome) {
        if reply.term != self.current_term || !self.role.is_leader() {
            return;
        }
        if let Role::Leader { peers, .. } = &mut self.role {
            if let Some(peer_state) = peers.get_mut(&from) {
                peer_state.in_flight = false;
                peer_state.last_ack = Some(Instant::now());
                if reply.success {
                    peer_state.match_index = LogIndex(reply.last_index);
                    peer_state.next_index = LogIndex(reply.last_index + 1);
                } else if let Some(conflict_index) = reply.conflict_index {
                    // Fast-rollback: skip a whole conflicting term in one step.
                    peer_state.next_index = LogIndex(conflict_index);
                } else {
                    peer_state.next_index = peer_state.next_index.prev().unwrap_or(LogIndex::ZERO).next();
                }
            }
        }
        self.recalculate_commit_index();
        self.check_pending_leave_completion();
        if let Some(pending) = &self.pending_membership_change {
            if pending.kind == MembershipChangeKind::Join && pending.server == from && reply.success {
                self.pending_membership_change = None; // joined server has acked; change verified
            }
        }
        let _ = outcome;
    }

    fn on_install_snapshot(&mut self, from: NodeAddr, req: InstallSnapshotReq, outcome: &mut Outcome) {
        self.become_follower(req.term.max(self.current_term), Some(from.clone()));
        self.role = Role::ReceiveSnapshot { leader_id: from.clone() };
        self.cluster_config = req.cluster_config.clone();
        self.log.install_snapshot_boundary(LogIndex(req.last_index), req.last_term);
        if req.done {
            let deadline = self.new_election_deadline();
            self.role = Role::Follower { leader_id: Some(from.clone()), election_deadline: deadline };
            self.commit_index = LogIndex(req.last_index);
        }
        outcome.outbound.push((from, Message::InstallSnapshotReply(InstallSnapshotReply { term: self.current_term, last_index: req.last_index })));
    }

    fn on_install_snapshot_reply(&mut self, from: NodeAddr, reply: InstallSnapshotReply, outcome: &mut Outcome) {
        if reply.term != self.current_term || !self.role.is_leader() {
            return;
        }
        if let Role::Leader { peers, .. } = &mut self.role {
            if let Some(peer_state) = peers.get_mut(&from) {
                peer_state.next_index = LogIndex(reply.last_index + 1);
                peer_state.match_index = LogIndex(reply.last_index);
            }
        }
        let _ = outcome;
    }

    // ---- client commands ---------------------------------------------------

    fn on_client_command(&mut self, command: Vec<u8>, from: Option<RequestId>) -> Outcome {
        let mut outcome = Outcome::default();
        if !self.role.is_leader() {
            outcome.proposal_error = Some(RaftError::NotLeader { hint: self.role.leader_id() });
            return outcome;
        }
        let index = self.log.next_index();
        let entry = LogEntry { index, term: self.current_term, kind: EntryKind::UserCommand(command), from };
        self.log.append(entry.clone());
        outcome.log_writes.push(entry);
        self.broadcast_append_entries(&mut outcome);
        outcome
    }

    // ---- membership change ---------------------------------------------------

    fn begin_membership_change(&mut self, kind: MembershipChangeKind, server: NodeAddr, from: Option<RequestId>) -> Outcome {
        let mut outcome = Outcome::default();
        if !self.role.is_leader() {
            outcome.proposal_error = Some(RaftError::NotLeader { hint: self.role.leader_id() });
            return outcome;
        }
        if self.pending_membership_change.is_some() {
            outcome.proposal_error = Some(RaftError::ClusterChangeInProgress);
            return outcome;
        }

        let new_config = match kind {
            MembershipChangeKind::Join => self.cluster_config.with_added(server.clone()),
            MembershipChangeKind::Leave => self.cluster_config.with_removed(&server),
        };
        let index = self.log.next_index();
        let entry = LogEntry { index, term: self.current_term, kind: EntryKind::ClusterConfig(new_config.clone()), from };
        self.cluster_config = new_config;
        self.log.append(entry.clone());
        outcome.log_writes.push(entry);

        if let Role::Leader { peers, .. } = &mut self.role {
            if kind == MembershipChangeKind::Join && !peers.contains_key(&server) {
                peers.insert(server.clone(), PeerState::new(index));
            }
            if kind == MembershipChangeKind::Leave {
                peers.remove(&server);
            }
        }

        self.pending_membership_change = Some(PendingMembershipChange {
            kind,
            server,
            started_at: Instant::now(),
            timeout: self.membership_cfg.verification_timeout,
            config_index: index,
        });
        self.broadcast_append_entries(&mut outcome);
        outcome
    }

    fn check_membership_timer(&mut self, now: Instant, outcome: &mut Outcome) {
        if now.duration_since(self.last_membership_tick) < self.membership_cfg.verification_tick {
            return;
        }
        self.last_membership_tick = now;
        let Some(pending) = self.pending_membership_change.clone() else { return };
        if now.duration_since(pending.started_at) < pending.timeout {
            return;
        }

        warn!(group = ?self.group_id, server = ?pending.server, "membership change verification timed out, reverting");
        let reverted_config = match pending.kind {
            MembershipChangeKind::Join => self.cluster_config.with_removed(&pending.server),
            MembershipChangeKind::Leave => self.cluster_config.with_added(pending.server.clone()),
        };
        let index = self.log.next_index();
        let entry = LogEntry { index, term: self.current_term, kind: EntryKind::ClusterConfig(reverted_config.clone()), from: None };
        self.cluster_config = reverted_config;
        self.log.append(entry.clone());
        outcome.log_writes.push(entry);
        outcome.membership_notification = Some((pending.server.clone(), MembershipRevertReason::VerificationTimeout));
        self.pending_membership_change = None;
        self.broadcast_append_entries(outcome);
    }
}

fn random_election_timeout(rng: &mut StdRng, timing: &RaftTimingConfig) -> Duration {
    let min = timing.election_timeout_min.as_millis() as u64;
    let max = timing.election_timeout_max.as_millis() as u64;
    Duration::from_millis(rng.random_range(min..=max))
}
