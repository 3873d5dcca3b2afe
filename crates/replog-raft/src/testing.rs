//! Helpers shared by the unit tests

use crate::{
    config::{RaftConfig, RaftNodeConfig},
    controller::{ControllerEvent, RaftContext},
    log_stream::memory::MemoryLogStream,
    raft::Raft,
    rpc::{Envelope, RaftMessage, RaftRequest, RaftResponse},
    transport::{Inbound, Subscription, Transport, TransportError},
    NodeAddr, PartitionId,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub(crate) fn addr(port: u16) -> NodeAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 26500 + port)
}

/// Raft at `addr(1)` with the given members and an empty in-memory log
pub(crate) fn raft(members: Vec<NodeAddr>) -> (Raft, Arc<MemoryLogStream>) {
    let log = Arc::new(MemoryLogStream::new(0));
    let config = RaftNodeConfig::new(0, addr(1), members);
    (Raft::new(&config, log.clone()), log)
}

pub(crate) fn context(
    transport: Arc<ScriptedTransport>,
) -> (RaftContext, mpsc::UnboundedReceiver<ControllerEvent>) {
    RaftContext::new(transport, RaftConfig::default())
}

/// Next event of the actor channel; panics after five (virtual) seconds
pub(crate) async fn next_event(
    events: &mut mpsc::UnboundedReceiver<ControllerEvent>,
) -> ControllerEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no controller event within 5s")
        .expect("event channel closed")
}

type Responder =
    Box<dyn Fn(NodeAddr, &RaftRequest) -> Result<RaftResponse, TransportError> + Send + Sync>;

/// Transport answering requests with a closure and recording all traffic
pub(crate) struct ScriptedTransport {
    responder: Responder,
    requests: Mutex<Vec<(NodeAddr, RaftRequest)>>,
    messages: Mutex<Vec<(NodeAddr, RaftMessage)>>,
    accept_messages: AtomicBool,
    subscriptions: Mutex<Vec<mpsc::UnboundedSender<Inbound>>>,
}

impl ScriptedTransport {
    pub(crate) fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(NodeAddr, &RaftRequest) -> Result<RaftResponse, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            accept_messages: AtomicBool::new(true),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Every request fails as unreachable
    pub(crate) fn silent() -> Arc<Self> {
        Self::new(|to, _| Err(TransportError::Unreachable(to)))
    }

    pub(crate) fn requests(&self) -> Vec<(NodeAddr, RaftRequest)> {
        self.requests.lock().clone()
    }

    pub(crate) fn messages(&self) -> Vec<(NodeAddr, RaftMessage)> {
        self.messages.lock().clone()
    }

    pub(crate) fn take_messages(&self) -> Vec<(NodeAddr, RaftMessage)> {
        std::mem::take(&mut *self.messages.lock())
    }

    pub(crate) fn set_accept_messages(&self, accept: bool) {
        self.accept_messages.store(accept, Ordering::SeqCst);
    }

    /// Push something into the most recent subscription
    pub(crate) fn deliver(&self, inbound: Inbound) -> bool {
        self.subscriptions
            .lock()
            .last()
            .map_or(false, |sender| sender.send(inbound).is_ok())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send_request(
        &self,
        to: NodeAddr,
        request: Envelope<RaftRequest>,
        _timeout: Duration,
    ) -> Result<RaftResponse, TransportError> {
        self.requests.lock().push((to, request.body.clone()));
        (self.responder)(to, &request.body)
    }

    fn send_message(&self, to: NodeAddr, message: Envelope<RaftMessage>) -> bool {
        if !self.accept_messages.load(Ordering::SeqCst) {
            return false;
        }
        self.messages.lock().push((to, message.body));
        true
    }

    async fn open_subscription(
        &self,
        _partition_id: PartitionId,
        _local: NodeAddr,
    ) -> Result<Subscription, TransportError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscriptions.lock().push(sender);
        Ok(Subscription::new(receiver))
    }
}
