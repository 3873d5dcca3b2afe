//! Raft consensus for a partitioned, replicated commit log
//!
//! Every partition of a cluster runs one Raft instance per node. An instance
//! elects a leader (a poll round first, then a vote round), replicates the
//! partition's log stream to its followers under a per-link backpressure
//! window, advances the commit position once a quorum holds an entry, and
//! lets members join and leave a running cluster.
//!
//! Log storage and the network are consumed through the [`LogStream`] and
//! [`Transport`] traits. In-memory implementations of both
//! ([`MemoryLogStream`], [`MemoryNetwork`]) ship with the crate.
//!
//! ```no_run
//! use replog_raft::{MemoryLogStream, MemoryNetwork, RaftHandle, RaftNodeConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> replog_raft::RaftResult<()> {
//! let network = MemoryNetwork::new();
//! let local = "127.0.0.1:26501".parse().unwrap();
//! let config = RaftNodeConfig::new(0, local, vec![]);
//! let log = Arc::new(MemoryLogStream::new(0));
//!
//! let raft = RaftHandle::spawn(config, log, network.transport(local))?;
//! raft.wait_for(|status| status.ready).await?;
//! raft.append(b"hello".to_vec()).await?;
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod backpressure;
pub mod config;
pub mod controller;
pub mod event;
pub mod heartbeat;
pub mod join;
pub mod log_stream;
pub mod raft;
pub mod registry;
pub mod rpc;
pub mod state;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use actor::RaftHandle;
pub use backpressure::BackpressureHelper;
pub use config::{RaftConfig, RaftNodeConfig};
pub use controller::commit::quorum_position;
pub use event::{RaftEvent, RaftEventKind};
pub use heartbeat::Heartbeat;
pub use log_stream::memory::MemoryLogStream;
pub use log_stream::{EventType, LogStream, LogStreamError, LogStreamReader, LoggedEvent};
pub use raft::{required_quorum, Raft};
pub use registry::PartitionRegistry;
pub use rpc::{
    AppendRequest, AppendResponse, ConfigurationRequest, ConfigurationResponse, Envelope,
    JoinRequest, JoinResponse, PollRequest, PollResponse, RaftMessage, RaftRequest, RaftResponse,
    VoteRequest, VoteResponse, WireMessage,
};
pub use state::{RaftMember, RaftState, RaftStatus};
pub use transport::memory::{MemoryNetwork, MemoryTransport};
pub use transport::{Inbound, Subscription, Transport, TransportError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for Raft operations
pub type RaftResult<T> = Result<T, RaftError>;

/// Errors that can occur during Raft operations
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("Node is not the leader")]
    NotLeader,

    #[error("Leader of term {0} has not committed its initial event yet")]
    LeaderNotReady(Term),

    #[error("Leaving the cluster while being its leader is not supported")]
    LeaveWhileLeader,

    #[error("Membership change failed: {0}")]
    MembershipChange(String),

    #[error("Serialization error: {0}")]
    SerializationEncodeError(#[from] bincode::error::EncodeError),

    #[error("Deserialization error: {0}")]
    SerializationDecodeError(#[from] bincode::error::DecodeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Log stream error: {0}")]
    LogStream(#[from] LogStreamError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Raft of partition {0} is closed")]
    Closed(PartitionId),
}

/// Network address of a cluster member
pub type NodeAddr = std::net::SocketAddr;

/// Term number in Raft consensus
pub type Term = u64;

/// Position of an event in a log stream
pub type Position = i64;

/// Identifier of a log partition
pub type PartitionId = u32;

/// Position value meaning "no event"
pub const POSITION_NULL: Position = -1;

/// Term value meaning "no event"
pub const TERM_NULL: Term = Term::MAX;

/// Position and term of a single log event
///
/// The derived ordering compares the term first and the position second,
/// which is exactly Raft's "at least as up-to-date" relation between the
/// last events of two logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventPointer {
    pub term: Term,
    pub position: Position,
}

impl EventPointer {
    pub fn new(position: Position, term: Term) -> Self {
        Self { term, position }
    }
}
