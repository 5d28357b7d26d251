//! Per-group runtime: the single-consumer task that owns one [`RaftServer`]
//! and drives it to completion. Every event that can affect this group —
//! ticks, peer messages, client commands, WAL durability and segment-sealed
//! notifications, liveness changes — is serialised onto one bounded
//! `mpsc::channel<Event>`; small forwarder tasks translate each outside
//! source into that one queue so the group itself never juggles a `select!`
//! across heterogeneous sources.
//!
//! One long-lived event-sourced actor per group, task-per-connection in
//! shape but never returning: the task runs until a `Terminate` event
//! drains and closes its queue.

use crate::apply::{ApplyLoop, Reply, StateMachine};
use crate::config::RaftTimingConfig;
use crate::error::Result;
use crate::liveness::LivenessOracle;
use crate::log::Log;
use crate::raft::message::Message;
use crate::raft::role::RoleKind;
use crate::raft::{Event, RaftServer};
use crate::transport::PeerTransport;
use crate::types::{EntryKind, GroupId, LogEntry, NodeAddr, RequestId};
use crate::wal::record::RecordKind;
use crate::wal::WalWriter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Converts a log entry produced by the Raft server into the `(kind,
/// payload)` pair the WAL writer's framing expects. The inverse of
/// `crate::log::record_to_entry`. Exposed so test harnesses driving a
/// `RaftServer` directly (without going through [`spawn`]) can replay
/// `Outcome::log_writes` into a `WalWriter` the same way the runtime does.
pub fn wal_kind_and_payload(entry: &LogEntry) -> Result<(RecordKind, Vec<u8>)> {
    Ok(match &entry.kind {
        EntryKind::Noop => (RecordKind::Noop, Vec::new()),
        EntryKind::UserCommand(payload) => (RecordKind::UserCommand, payload.clone()),
        EntryKind::ClusterConfig(cfg) => (RecordKind::ClusterConfig, bincode::encode_to_vec(cfg, bincode::config::standard())?),
    })
}

/// A still-hosted group's externally visible handle: the channel new events
/// are fed through, and the background task itself (for graceful shutdown).
pub struct GroupRuntime {
    group_id: GroupId,
    event_tx: mpsc::Sender<Event>,
    task: JoinHandle<()>,
}

impl GroupRuntime {
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn event_sender(&self) -> mpsc::Sender<Event> {
        self.event_tx.clone()
    }

    /// Submits a client command, correlating the eventual reply (if any) by
    /// `from`. Returns immediately; the reply (if the server was leader and
    /// the state machine produced one) arrives through the `on_reply`
    /// callback supplied at spawn time.
    pub async fn propose(&self, command: Vec<u8>, from: Option<RequestId>) -> Result<()> {
        self.event_tx
            .send(Event::ClientCommand { command, from })
            .await
            .map_err(|_| crate::error::RaftError::WalUnavailable)
    }

    /// Requests graceful termination; the task drains its queue and exits.
    pub async fn terminate(&self) {
        let _ = self.event_tx.send(Event::Terminate).await;
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Spawns the per-group task. `transport` delivers outbound peer messages;
/// `inbound` is this group's side of the transport (messages addressed to
/// `server.self_addr` for this group); `on_reply` is invoked once per
/// applied, leader-acknowledged client command.
#[allow(clippy::too_many_arguments)]
pub fn spawn<S: StateMachine + 'static>(
    mut server: RaftServer,
    log: Arc<Log>,
    wal: Arc<WalWriter>,
    state_machine: S,
    transport: Arc<dyn PeerTransport>,
    liveness: Arc<dyn LivenessOracle>,
    mut inbound: mpsc::Receiver<(NodeAddr, Message)>,
    timing: RaftTimingConfig,
    on_reply: impl Fn(RequestId, Reply) + Send + 'static,
    queue_depth: usize,
) -> GroupRuntime {
    let group_id = server.group_id;
    let (event_tx, mut event_rx) = mpsc::channel(queue_depth);

    // Forwarder: ticks.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(timing.heartbeat_interval);
            loop {
                ticker.tick().await;
                if tx.send(Event::Tick(std::time::Instant::now())).await.is_err() {
                    break;
                }
            }
        });
    }

    // Forwarder: inbound peer messages.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some((from, msg)) = inbound.recv().await {
                if tx.send(Event::Peer(from, msg)).await.is_err() {
                    break;
                }
            }
        });
    }

    // Forwarder: WAL durability notifications.
    {
        let tx = event_tx.clone();
        let mut durable_rx = wal.group_channel(group_id);
        tokio::spawn(async move {
            loop {
                if durable_rx.changed().await.is_err() {
                    break;
                }
                let index = *durable_rx.borrow();
                if tx.send(Event::WalDurable(index)).await.is_err() {
                    break;
                }
            }
        });
    }

    // Forwarder: liveness transitions.
    {
        let tx = event_tx.clone();
        let mut liveness_rx = liveness.subscribe();
        tokio::spawn(async move {
            loop {
                match liveness_rx.recv().await {
                    Ok(event) => {
                        if tx.send(Event::LivenessChanged(event.peer, event.state)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let task = tokio::spawn(async move {
        let mut apply_loop = ApplyLoop::new(log, state_machine);
        while let Some(event) = event_rx.recv().await {
            let terminating = matches!(event, Event::Terminate);
            let outcome = server.handle(event);

            for entry in &outcome.log_writes {
                let (kind, payload) = match wal_kind_and_payload(entry) {
                    Ok(v) => v,
                    Err(e) => {
                        error!(?group_id, error = %e, "failed to encode log entry for WAL append");
                        continue;
                    }
                };
                if let Err(e) = wal.append(group_id, entry.index, entry.term, kind, payload) {
                    error!(?group_id, error = %e, "WAL append failed");
                }
            }
            if !outcome.log_writes.is_empty() {
                let _ = wal.maybe_flush();
            }

            for (to, msg) in outcome.outbound {
                let transport = transport.clone();
                let group_id = group_id;
                tokio::spawn(async move {
                    if let Err(e) = transport.send(group_id, to.clone(), msg).await {
                        warn!(?group_id, peer = ?to, error = %e, "failed to send peer message");
                    }
                });
            }

            let is_leader = server.role_kind() == RoleKind::Leader;
            match apply_loop.advance(server.commit_index(), || is_leader) {
                Ok(replies) => {
                    for (from, reply) in replies {
                        if let Some(from) = from {
                            on_reply(from, reply);
                        }
                    }
                }
                Err(e) => error!(?group_id, error = %e, "apply loop failed"),
            }

            if terminating {
                break;
            }
        }
    });

    GroupRuntime { group_id, event_tx, task }
}

/// Convenience wrapper used by tests and embedders that want a steady
/// externally-driven tick source instead of the default heartbeat-interval
/// ticker installed by [`spawn`].
pub async fn drive_ticks(event_tx: &mpsc::Sender<Event>, count: usize, spacing: Duration) {
    for _ in 0..count {
        let _ = event_tx.send(Event::Tick(std::time::Instant::now())).await;
        tokio::time::sleep(spacing).await;
    }
}
