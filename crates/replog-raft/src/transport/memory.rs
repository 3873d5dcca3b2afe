//! In-process network connecting Raft instances through channels
//!
//! Every request, response and message is encoded and decoded on its way
//! through the network. Nodes can be isolated (traffic to and from them is
//! silently dropped) and throttled (their one-way messages are refused).

use super::{Inbound, Subscription, Transport, TransportError};
use crate::rpc::{Envelope, RaftMessage, RaftRequest, RaftResponse, WireMessage};
use crate::{NodeAddr, PartitionId};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

#[derive(Default)]
struct NetworkInner {
    /// Nodes that obtained a transport
    nodes: DashSet<NodeAddr>,

    /// Subscription per node and partition
    routes: DashMap<(NodeAddr, PartitionId), mpsc::UnboundedSender<Inbound>>,

    isolated: DashSet<NodeAddr>,
    throttled: DashSet<NodeAddr>,

    /// Requests sent per node
    requests_sent: DashMap<NodeAddr, u64>,
}

/// Shared in-memory network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for the node at `local`
    pub fn transport(&self, local: NodeAddr) -> Arc<MemoryTransport> {
        self.inner.nodes.insert(local);
        Arc::new(MemoryTransport {
            network: self.clone(),
            local,
        })
    }

    /// Drop all traffic from and to `address`
    pub fn isolate(&self, address: NodeAddr) {
        debug!("Isolating {}", address);
        self.inner.isolated.insert(address);
    }

    pub fn heal(&self, address: NodeAddr) {
        debug!("Healing {}", address);
        self.inner.isolated.remove(&address);
    }

    /// Refuse one-way messages sent by `address`
    pub fn throttle(&self, address: NodeAddr) {
        self.inner.throttled.insert(address);
    }

    pub fn unthrottle(&self, address: NodeAddr) {
        self.inner.throttled.remove(&address);
    }

    /// Number of requests `address` has sent so far
    pub fn requests_sent(&self, address: NodeAddr) -> u64 {
        self.inner
            .requests_sent
            .get(&address)
            .map_or(0, |count| *count.value())
    }

    fn is_cut(&self, from: NodeAddr, to: NodeAddr) -> bool {
        self.inner.isolated.contains(&from) || self.inner.isolated.contains(&to)
    }

    fn route(
        &self,
        to: NodeAddr,
        partition_id: PartitionId,
    ) -> Option<mpsc::UnboundedSender<Inbound>> {
        self.inner
            .routes
            .get(&(to, partition_id))
            .map(|route| route.value().clone())
    }

    async fn deliver_request(
        &self,
        from: NodeAddr,
        to: NodeAddr,
        request: Envelope<RaftRequest>,
    ) -> Result<RaftResponse, TransportError> {
        if self.is_cut(from, to) {
            return std::future::pending().await;
        }
        if !self.inner.nodes.contains(&to) {
            return Err(TransportError::Unreachable(to));
        }

        let envelope = transcode(&request)?;
        let partition_id = envelope.partition_id;
        let route = self
            .route(to, partition_id)
            .ok_or(TransportError::NoSubscription(to, partition_id))?;

        let (responder, response) = oneshot::channel();
        route
            .send(Inbound::Request {
                envelope,
                responder,
            })
            .map_err(|_| TransportError::NoSubscription(to, partition_id))?;

        let response = response
            .await
            .map_err(|_| TransportError::ResponderDropped(to))?;

        // the link may have been cut while the request was processed
        if self.is_cut(from, to) {
            return std::future::pending().await;
        }

        transcode(&response)
    }

    fn deliver_message(&self, from: NodeAddr, to: NodeAddr, message: Envelope<RaftMessage>) -> bool {
        if self.inner.throttled.contains(&from) {
            return false;
        }
        if self.is_cut(from, to) {
            return true;
        }

        let message = match transcode(&message) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping message from {} to {}: {}", from, to, e);
                return true;
            }
        };

        if let Some(route) = self.route(to, message.partition_id) {
            // a closed subscription drops the message like a lost packet
            let _ = route.send(Inbound::Message(message));
        }
        true
    }

    fn subscribe(&self, partition_id: PartitionId, local: NodeAddr) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner.routes.insert((local, partition_id), sender);
        Subscription::new(receiver)
    }
}

fn transcode<T: WireMessage>(message: &T) -> Result<T, TransportError> {
    let bytes = message.to_bytes()?;
    Ok(T::from_bytes(&bytes)?)
}

/// Endpoint of one node on a [`MemoryNetwork`]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: NodeAddr,
}

impl MemoryTransport {
    pub fn local(&self) -> NodeAddr {
        self.local
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_request(
        &self,
        to: NodeAddr,
        request: Envelope<RaftRequest>,
        timeout: Duration,
    ) -> Result<RaftResponse, TransportError> {
        *self
            .network
            .inner
            .requests_sent
            .entry(self.local)
            .or_insert(0) += 1;

        match tokio::time::timeout(timeout, self.network.deliver_request(self.local, to, request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(to)),
        }
    }

    fn send_message(&self, to: NodeAddr, message: Envelope<RaftMessage>) -> bool {
        self.network.deliver_message(self.local, to, message)
    }

    async fn open_subscription(
        &self,
        partition_id: PartitionId,
        local: NodeAddr,
    ) -> Result<Subscription, TransportError> {
        Ok(self.network.subscribe(partition_id, local))
    }
}
