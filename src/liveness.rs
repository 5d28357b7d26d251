//! External liveness oracle. Advisory only: a lying oracle may degrade
//! availability (slow or premature elections) but must never let a server
//! bypass `current_term`/`voted_for`/commit rules.
//!
//! Narrows a full SWIM-style gossip failure detector down to the up/down
//! advisory feed Raft's election timers actually need.

use crate::types::NodeAddr;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    Up,
    Down,
}

#[derive(Clone, Debug)]
pub struct LivenessEvent {
    pub peer: NodeAddr,
    pub state: Liveness,
}

#[async_trait]
pub trait LivenessOracle: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<LivenessEvent>;
    async fn current(&self, peer: &NodeAddr) -> Liveness;
}

/// Test/embedding adapter: liveness is whatever the caller injects.
pub struct StaticLivenessOracle {
    tx: broadcast::Sender<LivenessEvent>,
    state: Arc<RwLock<HashMap<NodeAddr, Liveness>>>,
}

impl StaticLivenessOracle {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        StaticLivenessOracle { tx, state: Arc::new(RwLock::new(HashMap::new())) }
    }

    pub async fn set(&self, peer: NodeAddr, state: Liveness) {
        self.state.write().await.insert(peer.clone(), state);
        let _ = self.tx.send(LivenessEvent { peer, state });
    }
}

impl Default for StaticLivenessOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LivenessOracle for StaticLivenessOracle {
    fn subscribe(&self) -> broadcast::Receiver<LivenessEvent> {
        self.tx.subscribe()
    }

    async fn current(&self, peer: &NodeAddr) -> Liveness {
        *self.state.read().await.get(peer).unwrap_or(&Liveness::Up)
    }
}

/// Adapter wrapping a SWIM-style gossip failure detector as a
/// `LivenessOracle`. Incarnation numbers and suspicion timeouts are the
/// gossip layer's concern; this adapter only translates
/// `MemberState::{Alive,Left}` to `Up` and `MemberState::{Suspect,Failed}`
/// to `Down` for Raft's consumption.
pub struct SwimLivenessOracle {
    tx: broadcast::Sender<LivenessEvent>,
    state: Arc<RwLock<HashMap<NodeAddr, Liveness>>>,
}

impl SwimLivenessOracle {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        SwimLivenessOracle { tx, state: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Called by the embedding gossip loop whenever a member's state
    /// transitions; translated and republished for Raft subscribers.
    pub async fn on_member_transition(&self, peer: NodeAddr, alive: bool) {
        let state = if alive { Liveness::Up } else { Liveness::Down };
        self.state.write().await.insert(peer.clone(), state);
        let _ = self.tx.send(LivenessEvent { peer, state });
    }
}

impl Default for SwimLivenessOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LivenessOracle for SwimLivenessOracle {
    fn subscribe(&self) -> broadcast::Receiver<LivenessEvent> {
        self.tx.subscribe()
    }

    async fn current(&self, peer: &NodeAddr) -> Liveness {
        *self.state.read().await.get(peer).unwrap_or(&Liveness::Up)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_oracle_reports_injected_state() {
        let oracle = StaticLivenessOracle::new();
        let peer = NodeAddr::new("b");
        oracle.set(peer.clone(), Liveness::Down).await;
        assert_eq!(oracle.current(&peer).await, Liveness::Down);
    }

    #[tokio::test]
    async fn subscribers_observe_transitions() {
        let oracle = StaticLivenessOracle::new();
        let mut rx = oracle.subscribe();
        oracle.set(NodeAddr::new("c"), Liveness::Down).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.state, Liveness::Down);
    }
}
