//! Network seam of a Raft
//!
//! Requests are answered through a oneshot responder handed to the
//! receiver. Messages are fire-and-forget; `send_message` returning `false`
//! means the link is backpressured and the caller keeps the message.

pub mod memory;

use crate::rpc::{Envelope, RaftMessage, RaftRequest, RaftResponse};
use crate::{NodeAddr, PartitionId};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Errors that can occur while talking to another member
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request to {0} timed out")]
    Timeout(NodeAddr),

    #[error("Member {0} is unreachable")]
    Unreachable(NodeAddr),

    #[error("Member {0} has no subscription for partition {1}")]
    NoSubscription(NodeAddr, PartitionId),

    #[error("Member {0} dropped the request without answering")]
    ResponderDropped(NodeAddr),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Transport is closed")]
    Closed,
}

impl From<bincode::error::EncodeError> for TransportError {
    fn from(err: bincode::error::EncodeError) -> Self {
        TransportError::Codec(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for TransportError {
    fn from(err: bincode::error::DecodeError) -> Self {
        TransportError::Codec(err.to_string())
    }
}

/// Something received on a subscription
#[derive(Debug)]
pub enum Inbound {
    Request {
        envelope: Envelope<RaftRequest>,
        responder: oneshot::Sender<RaftResponse>,
    },
    Message(Envelope<RaftMessage>),
}

/// Inbound traffic of one partition on one node
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Inbound>,
}

impl Subscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<Inbound>) -> Self {
        Self { receiver }
    }

    /// Next inbound item, `None` once the subscription was replaced or closed
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.receiver.recv().await
    }
}

/// Connection of a Raft to its peers
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait at most `timeout` for its response
    ///
    /// Dropping the returned future cancels the request.
    async fn send_request(
        &self,
        to: NodeAddr,
        request: Envelope<RaftRequest>,
        timeout: Duration,
    ) -> Result<RaftResponse, TransportError>;

    /// Queue a one-way message; false if the link cannot take it right now
    fn send_message(&self, to: NodeAddr, message: Envelope<RaftMessage>) -> bool;

    /// Start receiving requests and messages addressed to `partition_id` at `local`
    async fn open_subscription(
        &self,
        partition_id: PartitionId,
        local: NodeAddr,
    ) -> Result<Subscription, TransportError>;
}
