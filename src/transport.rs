//! Peer transport seam. Below this trait is "a reliable best-effort
//! message channel" — inter-node wire transport is out of scope for this
//! crate. It ships only an in-process channel transport for tests; it
//! never opens a socket.

use crate::error::{RaftError, Result};
use crate::raft::message::Message;
use crate::types::{GroupId, NodeAddr};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send(&self, group: GroupId, to: NodeAddr, msg: Message) -> Result<()>;
}

/// In-process transport used by integration tests: one bounded mpsc per
/// `(group, destination)` registered up front by the test harness.
pub struct ChannelTransport {
    routes: DashMap<(GroupId, NodeAddr), mpsc::Sender<(NodeAddr, Message)>>,
    from: NodeAddr,
}

impl ChannelTransport {
    pub fn new(from: NodeAddr) -> Arc<Self> {
        Arc::new(ChannelTransport { routes: DashMap::new(), from })
    }

    pub fn register_route(&self, group: GroupId, to: NodeAddr, sender: mpsc::Sender<(NodeAddr, Message)>) {
        self.routes.insert((group, to), sender);
    }
}

#[async_trait]
impl PeerTransport for ChannelTransport {
    async fn send(&self, group: GroupId, to: NodeAddr, msg: Message) -> Result<()> {
        let sender = self
            .routes
            .get(&(group, to.clone()))
            .map(|e| e.value().clone())
            .ok_or_else(|| RaftError::Serialization(format!("no route to {to:?} for group {group:?}")))?;
        sender
            .send((self.from.clone(), msg))
            .await
            .map_err(|_| RaftError::Serialization(format!("channel closed for {to:?}")))
    }
}
