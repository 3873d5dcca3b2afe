//! Raft roles, per-member replication state and the published status

use crate::{
    backpressure::BackpressureHelper, EventPointer, NodeAddr, PartitionId, Position, Term,
    POSITION_NULL, TERM_NULL,
};
use serde::{Deserialize, Serialize};

/// Role of a node within one partition's Raft
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftState {
    /// Takes replicated events from the leader; may poll once contact is lost
    Follower,
    /// Won a poll and asks the members for their vote in a new term
    Candidate,
    /// Owns the appender and replicates the partition's log
    Leader,
}

impl RaftState {
    pub fn is_leader(self) -> bool {
        self == RaftState::Leader
    }

    pub fn is_candidate(self) -> bool {
        self == RaftState::Candidate
    }

    pub fn is_follower(self) -> bool {
        self == RaftState::Follower
    }
}

/// Another participant of the partition, as seen by this node
///
/// The replication fields are only meaningful while this node leads. They
/// are reset whenever replication to the member (re)starts.
#[derive(Debug, Clone)]
pub struct RaftMember {
    address: NodeAddr,

    /// Highest position confirmed on the member
    match_position: Position,

    /// Last event sent to the member
    previous: Option<EventPointer>,

    /// Consecutive rejected appends
    failures: u32,

    backpressure: BackpressureHelper,
}

impl RaftMember {
    pub fn new(address: NodeAddr, backpressure_window: usize) -> Self {
        Self {
            address,
            match_position: POSITION_NULL,
            previous: None,
            failures: 0,
            backpressure: BackpressureHelper::new(backpressure_window),
        }
    }

    pub fn address(&self) -> NodeAddr {
        self.address
    }

    pub fn match_position(&self) -> Position {
        self.match_position
    }

    /// Raise the match position; lower values are ignored
    pub fn update_match_position(&mut self, position: Position) {
        self.match_position = self.match_position.max(position);
    }

    pub fn previous(&self) -> Option<EventPointer> {
        self.previous
    }

    pub fn previous_position(&self) -> Position {
        self.previous.map_or(POSITION_NULL, |p| p.position)
    }

    pub fn previous_term(&self) -> Term {
        self.previous.map_or(TERM_NULL, |p| p.term)
    }

    pub fn set_previous(&mut self, previous: Option<EventPointer>) {
        self.previous = previous;
    }

    /// Restart replication after `previous`, forgetting all progress
    pub fn reset_replication(&mut self, previous: Option<EventPointer>) {
        self.previous = previous;
        self.match_position = POSITION_NULL;
        self.failures = 0;
        self.backpressure.reset();
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn increment_failures(&mut self) {
        self.failures += 1;
    }

    pub fn reset_failures(&mut self) {
        self.failures = 0;
    }

    pub fn backpressure(&self) -> &BackpressureHelper {
        &self.backpressure
    }

    pub fn backpressure_mut(&mut self) -> &mut BackpressureHelper {
        &mut self.backpressure
    }
}

/// Snapshot of a Raft published to handles after every change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftStatus {
    pub partition_id: PartitionId,
    pub local: NodeAddr,
    pub term: Term,
    pub state: RaftState,
    pub leader: Option<NodeAddr>,

    /// All members including the local node
    pub members: Vec<NodeAddr>,

    pub commit_position: Position,

    /// Whether the node takes part in elections
    pub joined: bool,

    /// Whether the node leads and committed its term-initial event
    pub ready: bool,
}

impl RaftStatus {
    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }
}
