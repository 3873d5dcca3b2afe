//! Raft wire messages
//!
//! Requests expect a response:
//! - Poll (pre-vote without a term increment)
//! - Vote
//! - Join / Configuration (membership changes)
//!
//! Append requests and their responses are one-way messages. A follower
//! answers an append out-of-band with an acknowledgement or the position
//! the leader has to resume from.

use crate::{
    log_stream::LoggedEvent, EventPointer, NodeAddr, PartitionId, Position, Term, POSITION_NULL,
    TERM_NULL,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Last event position of an empty log
pub const LAST_EVENT_POSITION_NULL: Position = POSITION_NULL;

/// Last event term of an empty log
pub const LAST_EVENT_TERM_NULL: Term = TERM_NULL;

/// Previous event position of an append at the start of the log
pub const PREVIOUS_EVENT_POSITION_NULL: Position = POSITION_NULL;

/// Previous event term of an append at the start of the log
pub const PREVIOUS_EVENT_TERM_NULL: Term = TERM_NULL;

/// bincode codec shared by every message
pub trait WireMessage: Serialize + DeserializeOwned + Sized {
    /// Serialize to bytes
    fn to_bytes(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        use bincode::config;
        bincode::encode_to_vec(bincode::serde::Compat(self), config::standard())
    }

    /// Deserialize from bytes
    fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        use bincode::config;
        let (compat, _): (bincode::serde::Compat<Self>, _) =
            bincode::decode_from_slice(bytes, config::standard())?;
        Ok(compat.0)
    }
}

fn pointer(position: Position, term: Term) -> Option<EventPointer> {
    if position == POSITION_NULL {
        None
    } else {
        Some(EventPointer::new(position, term))
    }
}

/// Vote request
///
/// Sent by a candidate after it incremented its term
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Candidate's term
    pub term: Term,

    /// Candidate requesting the vote
    pub candidate: NodeAddr,

    /// Position of candidate's last event
    pub last_event_position: Position,

    /// Term of candidate's last event
    pub last_event_term: Term,
}

impl VoteRequest {
    pub fn new(term: Term, candidate: NodeAddr, last_event: Option<EventPointer>) -> Self {
        Self {
            term,
            candidate,
            last_event_position: last_event.map_or(LAST_EVENT_POSITION_NULL, |e| e.position),
            last_event_term: last_event.map_or(LAST_EVENT_TERM_NULL, |e| e.term),
        }
    }

    /// Candidate's last event, `None` for an empty log
    pub fn last_event(&self) -> Option<EventPointer> {
        pointer(self.last_event_position, self.last_event_term)
    }
}

/// Vote response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Current term, for candidate to update itself
    pub term: Term,

    /// True means candidate received vote
    pub granted: bool,
}

impl VoteResponse {
    pub fn granted(term: Term) -> Self {
        Self {
            term,
            granted: true,
        }
    }

    pub fn denied(term: Term) -> Self {
        Self {
            term,
            granted: false,
        }
    }
}

/// Poll request
///
/// Asks whether a vote would be granted, without disturbing the cluster
/// with a term increment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollRequest {
    /// Poller's current term
    pub term: Term,

    pub candidate: NodeAddr,
    pub last_event_position: Position,
    pub last_event_term: Term,
}

impl PollRequest {
    pub fn new(term: Term, candidate: NodeAddr, last_event: Option<EventPointer>) -> Self {
        Self {
            term,
            candidate,
            last_event_position: last_event.map_or(LAST_EVENT_POSITION_NULL, |e| e.position),
            last_event_term: last_event.map_or(LAST_EVENT_TERM_NULL, |e| e.term),
        }
    }

    pub fn last_event(&self) -> Option<EventPointer> {
        pointer(self.last_event_position, self.last_event_term)
    }
}

/// Poll response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResponse {
    pub term: Term,
    pub granted: bool,
}

impl PollResponse {
    pub fn granted(term: Term) -> Self {
        Self {
            term,
            granted: true,
        }
    }

    pub fn denied(term: Term) -> Self {
        Self {
            term,
            granted: false,
        }
    }
}

/// Append request
///
/// Carries at most one event. Without an event it is a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendRequest {
    /// Leader's term
    pub term: Term,

    /// Position of the event immediately preceding `event`
    pub previous_event_position: Position,

    /// Term of the event immediately preceding `event`
    pub previous_event_term: Term,

    /// Leader's commit position
    pub commit_position: Position,

    pub event: Option<LoggedEvent>,
}

impl AppendRequest {
    pub fn new(
        term: Term,
        previous: Option<EventPointer>,
        commit_position: Position,
        event: Option<LoggedEvent>,
    ) -> Self {
        Self {
            term,
            previous_event_position: previous.map_or(PREVIOUS_EVENT_POSITION_NULL, |p| p.position),
            previous_event_term: previous.map_or(PREVIOUS_EVENT_TERM_NULL, |p| p.term),
            commit_position,
            event,
        }
    }

    /// Event preceding `event`, `None` at the start of the log
    pub fn previous_event(&self) -> Option<EventPointer> {
        pointer(self.previous_event_position, self.previous_event_term)
    }

    /// Check if this is a heartbeat message
    pub fn is_heartbeat(&self) -> bool {
        self.event.is_none()
    }
}

/// Answer of a follower to an append request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    /// Follower's term
    pub term: Term,

    pub succeeded: bool,

    /// Highest matching position on success, the position to resume from on failure
    pub position: Position,
}

impl AppendResponse {
    pub fn acknowledged(term: Term, position: Position) -> Self {
        Self {
            term,
            succeeded: true,
            position,
        }
    }

    pub fn failed(term: Term, position: Position) -> Self {
        Self {
            term,
            succeeded: false,
            position,
        }
    }
}

/// Request of a member to change its own membership
///
/// `members` is the requester's view of the cluster. The subject of the
/// change is always the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationRequest {
    pub term: Term,
    pub members: Vec<NodeAddr>,
    pub leaving: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationResponse {
    pub term: Term,
    pub succeeded: bool,

    /// Responder's view of the cluster, including itself
    pub members: Vec<NodeAddr>,

    /// Leader known to the responder
    pub leader: Option<NodeAddr>,
}

/// Request of a new member to be added to the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub term: Term,
    pub member: NodeAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    pub term: Term,
    pub succeeded: bool,
    pub members: Vec<NodeAddr>,
    pub leader: Option<NodeAddr>,
}

/// Requests answered with a [`RaftResponse`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRequest {
    Vote(VoteRequest),
    Poll(PollRequest),
    Configuration(ConfigurationRequest),
    Join(JoinRequest),
}

impl RaftRequest {
    /// Get the term from any request
    pub fn term(&self) -> Term {
        match self {
            RaftRequest::Vote(req) => req.term,
            RaftRequest::Poll(req) => req.term,
            RaftRequest::Configuration(req) => req.term,
            RaftRequest::Join(req) => req.term,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftResponse {
    Vote(VoteResponse),
    Poll(PollResponse),
    Configuration(ConfigurationResponse),
    Join(JoinResponse),
}

impl RaftResponse {
    /// Get the term from any response
    pub fn term(&self) -> Term {
        match self {
            RaftResponse::Vote(resp) => resp.term,
            RaftResponse::Poll(resp) => resp.term,
            RaftResponse::Configuration(resp) => resp.term,
            RaftResponse::Join(resp) => resp.term,
        }
    }

    /// Whether a membership change succeeded; always false for poll and vote
    pub fn membership_succeeded(&self) -> bool {
        match self {
            RaftResponse::Configuration(resp) => resp.succeeded,
            RaftResponse::Join(resp) => resp.succeeded,
            _ => false,
        }
    }

    /// Member list carried by a membership response
    pub fn members(&self) -> &[NodeAddr] {
        match self {
            RaftResponse::Configuration(resp) => &resp.members,
            RaftResponse::Join(resp) => &resp.members,
            _ => &[],
        }
    }

    /// Leader hint carried by a membership response
    pub fn leader(&self) -> Option<NodeAddr> {
        match self {
            RaftResponse::Configuration(resp) => resp.leader,
            RaftResponse::Join(resp) => resp.leader,
            _ => None,
        }
    }
}

/// One-way messages of the replication protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    Append(AppendRequest),
    AppendResponse(AppendResponse),
}

impl RaftMessage {
    pub fn term(&self) -> Term {
        match self {
            RaftMessage::Append(req) => req.term,
            RaftMessage::AppendResponse(resp) => resp.term,
        }
    }
}

/// Addressing frame around every request and message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub partition_id: PartitionId,
    pub sender: NodeAddr,
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn new(partition_id: PartitionId, sender: NodeAddr, body: T) -> Self {
        Self {
            partition_id,
            sender,
            body,
        }
    }
}

impl<T: Serialize + DeserializeOwned> WireMessage for Envelope<T> {}
impl WireMessage for RaftRequest {}
impl WireMessage for RaftResponse {}
impl WireMessage for RaftMessage {}
