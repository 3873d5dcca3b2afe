//! Term-scoped Raft events written to the log stream
//!
//! Every new leader writes an initial event carrying the member list before
//! it serves anything. Membership changes are written as separate events.
//! Followers adopt the member list of every Raft event they append.

use crate::{rpc::WireMessage, NodeAddr, Term};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftEventKind {
    /// First event of a leader's term
    Initial,
    /// Member list changed
    MembersChanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftEvent {
    pub kind: RaftEventKind,

    /// Term of the leader that wrote the event
    pub term: Term,

    /// Complete member list, including the leader
    pub members: Vec<NodeAddr>,
}

impl RaftEvent {
    pub fn initial(term: Term, members: Vec<NodeAddr>) -> Self {
        Self {
            kind: RaftEventKind::Initial,
            term,
            members,
        }
    }

    pub fn members_changed(term: Term, members: Vec<NodeAddr>) -> Self {
        Self {
            kind: RaftEventKind::MembersChanged,
            term,
            members,
        }
    }
}

impl WireMessage for RaftEvent {}
