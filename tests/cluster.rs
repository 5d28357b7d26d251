//! End-to-end cluster scenarios and invariant checks.
//!
//! Each simulated server owns a real `WalWriter`, `Log`, and `RaftServer`
//! over its own `tempfile::TempDir`, wired together with `ChannelTransport`.
//! Time is simulated by constructing explicit future `Instant` values and
//! feeding them as `Event::Tick`, rather than sleeping the test thread, so
//! scenarios are deterministic and fast regardless of the configured
//! election timeouts.

use raft_core::config::{MembershipConfig, RaftTimingConfig, WalConfig};
use raft_core::error::RaftError;
use raft_core::group::wal_kind_and_payload;
use raft_core::log::{Fetch, Log};
use raft_core::raft::message::Message;
use raft_core::raft::role::RoleKind;
use raft_core::raft::{Event, RaftServer};
use raft_core::transport::{ChannelTransport, PeerTransport};
use raft_core::types::{ClusterConfig, EntryKind, GroupId, LogEntry, LogIndex, NodeAddr, RequestId, Term};
use raft_core::wal::WalWriter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

struct TestServer {
    server: RaftServer,
    log: Arc<Log>,
    wal: Arc<WalWriter>,
    transport: Arc<ChannelTransport>,
    inbox: mpsc::Receiver<(NodeAddr, Message)>,
    /// Mirrors the per-group forwarder `group::spawn` installs in the real
    /// runtime: observes this server's own durable frontier so the harness
    /// can deliver `Event::WalDurable` the same way a hosted node would.
    durable_rx: watch::Receiver<LogIndex>,
    _wal_dir: TempDir,
}

struct TestCluster {
    group_id: GroupId,
    servers: HashMap<NodeAddr, TestServer>,
    t0: Instant,
}

impl TestCluster {
    /// Builds a cluster with one server per `(addr, timing)` pair, all
    /// members of the same starting `ClusterConfig`, fully connected via
    /// `ChannelTransport`.
    async fn new(members: Vec<(&str, RaftTimingConfig)>, membership: MembershipConfig) -> Self {
        let group_id = GroupId::new(1);
        let addrs: Vec<NodeAddr> = members.iter().map(|(a, _)| NodeAddr::new(*a)).collect();
        let cluster_config = ClusterConfig::new(addrs.clone());

        let mut txs: HashMap<NodeAddr, mpsc::Sender<(NodeAddr, Message)>> = HashMap::new();
        let mut rxs: HashMap<NodeAddr, mpsc::Receiver<(NodeAddr, Message)>> = HashMap::new();
        for addr in &addrs {
            let (tx, rx) = mpsc::channel(1024);
            txs.insert(addr.clone(), tx);
            rxs.insert(addr.clone(), rx);
        }

        let mut servers = HashMap::new();
        for (i, (name, timing)) in members.into_iter().enumerate() {
            let addr = NodeAddr::new(name);
            let wal_dir = tempfile::tempdir().unwrap();
            let (wal, _sealed_rx, recovered) = WalWriter::open(wal_dir.path(), WalConfig::default()).unwrap();
            assert!(recovered.is_empty());

            let log = Arc::new(Log::new(group_id));
            let transport = ChannelTransport::new(addr.clone());
            for other in &addrs {
                transport.register_route(group_id, other.clone(), txs[other].clone());
            }

            let server = RaftServer::new(group_id, addr.clone(), log.clone(), cluster_config.clone(), timing, membership, i as u64 + 1);

            let inbox = rxs.remove(&addr).unwrap();
            let durable_rx = wal.group_channel(group_id);
            servers.insert(addr, TestServer { server, log, wal, transport, inbox, durable_rx, _wal_dir: wal_dir });
        }

        TestCluster { group_id, servers, t0: Instant::now() }
    }

    /// Feeds `event` to `addr`'s server, persisting any log writes and
    /// forwarding any outbound messages, exactly as `group::spawn`'s task
    /// would. Also flushes the WAL and delivers the resulting durability
    /// notification inline, the way a real node's short batch delay would
    /// in a cluster this small and quiet.
    async fn step(&mut self, addr: &str, event: Event) {
        self.step_inner(addr, event, true).await;
    }

    /// Like [`Self::step`] but withholds the WAL flush, so any append-entries
    /// reply this server owes stays gated on durability until a later
    /// explicit [`Self::flush`] call — used to exercise that gating directly.
    async fn step_no_flush(&mut self, addr: &str, event: Event) {
        self.step_inner(addr, event, false).await;
    }

    async fn step_inner(&mut self, addr: &str, event: Event, flush: bool) {
        let group_id = self.group_id;
        let addr = NodeAddr::new(addr);
        let ts = self.servers.get_mut(&addr).expect("unknown server");
        let outcome = ts.server.handle(event);

        for entry in &outcome.log_writes {
            let (kind, payload) = wal_kind_and_payload(entry).unwrap();
            ts.wal.append(group_id, entry.index, entry.term, kind, payload).unwrap();
        }
        if flush && !outcome.log_writes.is_empty() {
            ts.wal.flush().unwrap();
        }
        Self::deliver_durability(ts, group_id).await;

        for (to, msg) in outcome.outbound {
            ts.transport.send(group_id, to, msg).await.unwrap();
        }
    }

    /// Flushes `addr`'s WAL and delivers the resulting `WalDurable`
    /// notification to its own server, mirroring the per-group forwarder
    /// task `group::spawn` installs against `WalWriter::group_channel`.
    async fn flush(&mut self, addr: &str) {
        let group_id = self.group_id;
        let ts = self.servers.get_mut(&NodeAddr::new(addr)).expect("unknown server");
        ts.wal.flush().unwrap();
        Self::deliver_durability(ts, group_id).await;
    }

    async fn deliver_durability(ts: &mut TestServer, group_id: GroupId) {
        if ts.durable_rx.has_changed().unwrap_or(false) {
            let index = *ts.durable_rx.borrow_and_update();
            let durable_outcome = ts.server.handle(Event::WalDurable(index));
            for (to, msg) in durable_outcome.outbound {
                ts.transport.send(group_id, to, msg).await.unwrap();
            }
        }
    }

    async fn tick(&mut self, addr: &str, at: Instant) {
        self.step(addr, Event::Tick(at)).await;
    }

    async fn tick_all(&mut self, addrs: &[&str], at: Instant) {
        for addr in addrs {
            self.tick(addr, at).await;
        }
    }

    /// Drains every pending inbound message for `addr`, feeding each as a
    /// `Peer` event, until its inbox is empty.
    async fn drain_inbox(&mut self, addr: &str) {
        self.drain_inbox_inner(addr, true).await;
    }

    /// Like [`Self::drain_inbox`] but withholds each server's WAL flush —
    /// see [`Self::step_no_flush`].
    async fn drain_inbox_no_flush(&mut self, addr: &str) {
        self.drain_inbox_inner(addr, false).await;
    }

    async fn drain_inbox_inner(&mut self, addr: &str, flush: bool) {
        loop {
            let addr_key = NodeAddr::new(addr);
            let msg = {
                let ts = self.servers.get_mut(&addr_key).unwrap();
                ts.inbox.try_recv().ok()
            };
            let Some((from, msg)) = msg else { break };
            self.step_inner(addr, Event::Peer(from, msg), flush).await;
        }
    }

    /// Runs several rounds of "drain every inbox" until no server has
    /// pending inbound traffic — enough to settle one heartbeat's worth of
    /// request/reply traffic in a small cluster.
    async fn settle(&mut self, addrs: &[&str]) {
        for _ in 0..8 {
            for addr in addrs {
                self.drain_inbox(addr).await;
            }
        }
    }

    /// Like [`Self::settle`] but withholds every server's WAL flush.
    async fn settle_no_flush(&mut self, addrs: &[&str]) {
        for _ in 0..8 {
            for addr in addrs {
                self.drain_inbox_no_flush(addr).await;
            }
        }
    }

    fn role(&self, addr: &str) -> RoleKind {
        self.servers[&NodeAddr::new(addr)].server.role_kind()
    }

    fn commit_index(&self, addr: &str) -> LogIndex {
        self.servers[&NodeAddr::new(addr)].server.commit_index()
    }

    fn log_of(&self, addr: &str) -> &Arc<Log> {
        &self.servers[&NodeAddr::new(addr)].log
    }

    fn handle_direct(&mut self, addr: &str, event: Event) -> raft_core::raft::Outcome {
        self.servers.get_mut(&NodeAddr::new(addr)).unwrap().server.handle(event)
    }
}

fn fast_timing() -> RaftTimingConfig {
    let mut cfg = RaftTimingConfig::default();
    cfg.election_timeout_min = Duration::from_millis(5);
    cfg.election_timeout_max = Duration::from_millis(10);
    cfg.heartbeat_interval = Duration::from_millis(1);
    cfg
}

fn slow_timing() -> RaftTimingConfig {
    let mut cfg = RaftTimingConfig::default();
    cfg.election_timeout_min = Duration::from_secs(3600);
    cfg.election_timeout_max = Duration::from_secs(7200);
    cfg.heartbeat_interval = Duration::from_millis(1);
    cfg
}

fn expect_user_command(fetch: Fetch, expected: &[u8]) {
    match fetch {
        Fetch::Entry(e) => match e.kind {
            EntryKind::UserCommand(payload) => assert_eq!(payload, expected),
            _ => panic!("expected a user command entry"),
        },
        _ => panic!("expected entry to be present"),
    }
}

/// Scenario 1: basic election. A's timer is tuned to fire well before B/C's,
/// so feeding all three the same future tick elects A deterministically.
#[tokio::test]
async fn scenario_basic_election() {
    let mut cluster = TestCluster::new(
        vec![("A", fast_timing()), ("B", slow_timing()), ("C", slow_timing())],
        MembershipConfig::default(),
    )
    .await;
    let t0 = cluster.t0;

    // Fires pre-vote on A only (B, C have multi-hour timeouts).
    cluster.tick_all(&["A", "B", "C"], t0 + Duration::from_millis(50)).await;
    cluster.settle(&["A", "B", "C"]).await;
    // A's pre-vote quorum unlocks a real election in the same tick; settle
    // the resulting RequestVote/RequestVoteReply/AppendEntries rounds.
    cluster.settle(&["A", "B", "C"]).await;

    assert_eq!(cluster.role("A"), RoleKind::Leader);
    assert_eq!(cluster.role("B"), RoleKind::Follower);
    assert_eq!(cluster.role("C"), RoleKind::Follower);

    // The leader's noop at index 1 should have committed once it heard back
    // from a quorum (itself + one follower already satisfies 2-of-3).
    assert_eq!(cluster.commit_index("A"), LogIndex(1));
    match cluster.log_of("A").fetch(LogIndex(1)) {
        Fetch::Entry(e) => assert!(matches!(e.kind, EntryKind::Noop)),
        _ => panic!("expected noop at index 1"),
    }
}

/// Scenario 2: write and commit. After electing A, a client command is
/// proposed; it must replicate, commit, and be durably WAL-written before
/// being acknowledged.
#[tokio::test]
async fn scenario_write_and_commit() {
    let mut cluster = TestCluster::new(
        vec![("A", fast_timing()), ("B", slow_timing()), ("C", slow_timing())],
        MembershipConfig::default(),
    )
    .await;
    let t0 = cluster.t0;
    cluster.tick_all(&["A", "B", "C"], t0 + Duration::from_millis(50)).await;
    cluster.settle(&["A", "B", "C"]).await;
    cluster.settle(&["A", "B", "C"]).await;
    assert_eq!(cluster.role("A"), RoleKind::Leader);

    // Propose, replicate, and drain with flushing withheld everywhere: the
    // entry reaches every log and every inbox empties, but with no server's
    // WAL durably fsynced, no append-entries reply can carry it yet, so it
    // must not be visible as committed.
    cluster
        .step_no_flush("A", Event::ClientCommand { command: b"put:k:v".to_vec(), from: Some(RequestId(1)) })
        .await;
    cluster.settle_no_flush(&["A", "B", "C"]).await;

    assert_eq!(cluster.commit_index("A"), LogIndex(1));
    expect_user_command(cluster.log_of("B").fetch(LogIndex(2)), b"put:k:v");

    // Flushing each node's WAL (and delivering the resulting durability
    // notification, as the real per-group forwarder would) releases the
    // acks that were withheld and lets the entry commit.
    cluster.flush("A").await;
    cluster.flush("B").await;
    cluster.flush("C").await;
    cluster.settle(&["A", "B", "C"]).await;

    assert_eq!(cluster.commit_index("A"), LogIndex(2));
    assert!(cluster.servers[&NodeAddr::new("A")].wal.flushed_record_count() >= 2);
}

/// Scenario 4: conflicting suffix. C holds a stale uncommitted entry at
/// index 3 under term 1 that never replicated; once B (term 2) becomes
/// leader and replicates its own index-3 entry, C's conflicting entry must
/// be overwritten, not merged.
#[tokio::test]
async fn scenario_conflicting_suffix_is_overwritten() {
    let mut cluster = TestCluster::new(
        vec![("A", slow_timing()), ("B", fast_timing()), ("C", slow_timing())],
        MembershipConfig::default(),
    )
    .await;

    let t0 = cluster.t0;
    cluster.tick_all(&["A"], t0 + Duration::from_millis(50)).await;
    cluster.settle(&["A", "B", "C"]).await;
    cluster.settle(&["A", "B", "C"]).await;
    assert_eq!(cluster.role("A"), RoleKind::Leader);

    // Seed C with a stale, never-replicated entry at index 3 term 1 — this
    // is fixture setup (bypassing the normal propose path), not something a
    // real node does to itself.
    let c_log = cluster.log_of("C").clone();
    c_log.append(LogEntry { index: LogIndex(3), term: Term(1), kind: EntryKind::UserCommand(b"stale".to_vec()), from: None });

    // B takes over as leader at a higher term.
    let t1 = t0 + Duration::from_millis(500);
    cluster.tick_all(&["B"], t1).await;
    cluster.settle(&["A", "B", "C"]).await;
    cluster.settle(&["A", "B", "C"]).await;
    assert_eq!(cluster.role("B"), RoleKind::Leader);

    cluster.step("B", Event::ClientCommand { command: b"authoritative".to_vec(), from: None }).await;
    cluster.settle(&["A", "B", "C"]).await;

    expect_user_command(cluster.log_of("C").fetch(LogIndex(3)), b"authoritative");
}

/// Scenario 5: join with a verification timeout. The joining server never
/// acks, so the leader must revert the membership change once the
/// verification timer elapses, and a subsequent join must then succeed.
#[tokio::test]
async fn scenario_join_verification_timeout() {
    let mut membership = MembershipConfig::default();
    membership.verification_tick = Duration::from_millis(1);
    membership.verification_timeout = Duration::from_millis(5);

    let mut cluster = TestCluster::new(vec![("A", fast_timing()), ("B", slow_timing())], membership).await;
    let t0 = cluster.t0;
    cluster.tick_all(&["A", "B"], t0 + Duration::from_millis(50)).await;
    cluster.settle(&["A", "B"]).await;
    cluster.settle(&["A", "B"]).await;
    assert_eq!(cluster.role("A"), RoleKind::Leader);

    cluster.step("A", Event::Join { server: NodeAddr::new("D"), from: None }).await;

    // D never acks (no transport route registered for D); a second join
    // must be rejected while the first is pending.
    let outcome = cluster.handle_direct("A", Event::Join { server: NodeAddr::new("E"), from: None });
    assert!(matches!(outcome.proposal_error, Some(RaftError::ClusterChangeInProgress)));

    // Advance past the verification timeout; the leader's tick handler
    // should revert the pending change.
    let t_after_timeout = t0 + Duration::from_millis(200);
    cluster.tick("A", t_after_timeout).await;
    cluster.settle(&["A", "B"]).await;

    let outcome = cluster.handle_direct("A", Event::Join { server: NodeAddr::new("E"), from: None });
    assert!(outcome.proposal_error.is_none(), "join should succeed once the prior change reverted");
}

/// Scenario 6: a `Leave` never gets an ack from the departing server (it's
/// removed from `peers` before the leader's next broadcast), so it must
/// complete once its config entry commits via the remaining members' acks,
/// not revert through the verification-timeout path.
#[tokio::test]
async fn scenario_leave_completes_on_commit() {
    let mut membership = MembershipConfig::default();
    membership.verification_tick = Duration::from_millis(1);
    membership.verification_timeout = Duration::from_millis(5);

    let mut cluster = TestCluster::new(
        vec![("A", fast_timing()), ("B", slow_timing()), ("C", slow_timing())],
        membership,
    )
    .await;
    let t0 = cluster.t0;
    cluster.tick_all(&["A", "B", "C"], t0 + Duration::from_millis(50)).await;
    cluster.settle(&["A", "B", "C"]).await;
    cluster.settle(&["A", "B", "C"]).await;
    assert_eq!(cluster.role("A"), RoleKind::Leader);

    cluster.step("A", Event::Leave { server: NodeAddr::new("B"), from: None }).await;
    cluster.settle(&["A", "C"]).await;

    assert_eq!(cluster.commit_index("A"), LogIndex(2));

    // Well past the verification timeout: the config entry already
    // committed, so the pending change must already be clear and this tick
    // must not revert it.
    let t_after_timeout = t0 + Duration::from_millis(200);
    let outcome = cluster.handle_direct("A", Event::Tick(t_after_timeout));
    assert!(outcome.membership_notification.is_none());

    // A fresh membership change is accepted immediately rather than
    // rejected with `ClusterChangeInProgress`.
    let outcome = cluster.handle_direct("A", Event::Join { server: NodeAddr::new("D"), from: None });
    assert!(outcome.proposal_error.is_none());
}

/// At most one pending membership change per group — a second change
/// while one is outstanding is rejected outright, never queued.
#[tokio::test]
async fn single_pending_membership_change_at_a_time() {
    let mut cluster = TestCluster::new(vec![("A", fast_timing()), ("B", slow_timing())], MembershipConfig::default()).await;
    let t0 = cluster.t0;
    cluster.tick_all(&["A", "B"], t0 + Duration::from_millis(50)).await;
    cluster.settle(&["A", "B"]).await;
    cluster.settle(&["A", "B"]).await;
    assert_eq!(cluster.role("A"), RoleKind::Leader);

    cluster.step("A", Event::Join { server: NodeAddr::new("D"), from: None }).await;
    let outcome = cluster.handle_direct("A", Event::Leave { server: NodeAddr::new("B"), from: None });
    assert!(matches!(outcome.proposal_error, Some(RaftError::ClusterChangeInProgress)));
}
