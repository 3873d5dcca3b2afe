//! State of one Raft instance
//!
//! A `Raft` is owned by exactly one actor. Controllers receive it by
//! mutable reference; nothing here is shared or locked. The receiver side
//! of poll, vote and append lives here as well, since it only touches this
//! state and the log stream.

use crate::{
    config::RaftNodeConfig,
    event::RaftEvent,
    heartbeat::Heartbeat,
    log_stream::{EventType, LogStream},
    rpc::{AppendRequest, AppendResponse, PollRequest, PollResponse, VoteRequest, VoteResponse, WireMessage},
    state::{RaftMember, RaftState, RaftStatus},
    EventPointer, NodeAddr, PartitionId, Position, Term, POSITION_NULL,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Number of members (including self) whose agreement is a majority
pub fn required_quorum(member_count: usize) -> usize {
    member_count / 2 + 1
}

pub struct Raft {
    partition_id: PartitionId,
    local: NodeAddr,

    /// Latest term seen (initialized to 0, increases monotonically)
    term: Term,

    state: RaftState,

    /// Member that received this node's vote in the current term
    voted_for: Option<NodeAddr>,

    /// Current leader (if known)
    leader: Option<NodeAddr>,

    /// Other participants, without the local node
    members: Vec<RaftMember>,

    log_stream: Arc<dyn LogStream>,
    heartbeat: Heartbeat,

    /// Whether this node takes part in elections
    joined: bool,

    /// Position of this leader's term-initial event
    initial_event_position: Option<Position>,

    /// Whether this leader committed its term-initial event
    ready: bool,

    backpressure_window: usize,
}

impl Raft {
    pub fn new(config: &RaftNodeConfig, log_stream: Arc<dyn LogStream>) -> Self {
        let mut raft = Self {
            partition_id: config.partition_id,
            local: config.local_address,
            term: 0,
            state: RaftState::Follower,
            voted_for: None,
            leader: None,
            members: Vec::new(),
            log_stream,
            heartbeat: Heartbeat::from_config(&config.raft),
            joined: config.bootstrap,
            initial_event_position: None,
            ready: false,
            backpressure_window: config.raft.backpressure_window(),
        };
        raft.set_members(&config.members);
        raft
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn local(&self) -> NodeAddr {
        self.local
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn state(&self) -> RaftState {
        self.state
    }

    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    pub fn leader(&self) -> Option<NodeAddr> {
        self.leader
    }

    pub fn voted_for(&self) -> Option<NodeAddr> {
        self.voted_for
    }

    pub fn log_stream(&self) -> &Arc<dyn LogStream> {
        &self.log_stream
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    pub fn heartbeat_mut(&mut self) -> &mut Heartbeat {
        &mut self.heartbeat
    }

    pub fn joined(&self) -> bool {
        self.joined
    }

    pub fn set_joined(&mut self, joined: bool) {
        self.joined = joined;
    }

    pub fn initial_event_position(&self) -> Option<Position> {
        self.initial_event_position
    }

    pub fn set_initial_event_position(&mut self, position: Position) {
        self.initial_event_position = Some(position);
    }

    pub fn clear_initial_event_position(&mut self) {
        self.initial_event_position = None;
    }

    /// Whether this node leads and committed its term-initial event
    pub fn is_ready(&self) -> bool {
        self.state.is_leader() && self.ready
    }

    pub fn set_ready(&mut self) {
        self.ready = true;
    }

    /// Number of participants including the local node
    pub fn member_count(&self) -> usize {
        self.members.len() + 1
    }

    pub fn quorum(&self) -> usize {
        required_quorum(self.member_count())
    }

    pub fn members(&self) -> &[RaftMember] {
        &self.members
    }

    pub fn members_mut(&mut self) -> &mut [RaftMember] {
        &mut self.members
    }

    pub fn member_mut(&mut self, address: NodeAddr) -> Option<&mut RaftMember> {
        self.members.iter_mut().find(|m| m.address() == address)
    }

    /// Addresses of the other participants
    pub fn member_addresses(&self) -> Vec<NodeAddr> {
        self.members.iter().map(|m| m.address()).collect()
    }

    /// All participants, local node first
    pub fn cluster_addresses(&self) -> Vec<NodeAddr> {
        std::iter::once(self.local)
            .chain(self.members.iter().map(|m| m.address()))
            .collect()
    }

    /// Whether `address` is a participant, the local node included
    pub fn is_member(&self, address: NodeAddr) -> bool {
        address == self.local || self.members.iter().any(|m| m.address() == address)
    }

    /// Replace the member list, keeping the state of members that stay
    pub fn set_members(&mut self, addresses: &[NodeAddr]) {
        let mut members: Vec<RaftMember> = Vec::with_capacity(addresses.len());

        for &address in addresses {
            if address == self.local || members.iter().any(|m| m.address() == address) {
                continue;
            }

            let member = match self.members.iter().position(|m| m.address() == address) {
                Some(index) => self.members.swap_remove(index),
                None => RaftMember::new(address, self.backpressure_window),
            };
            members.push(member);
        }

        self.members = members;
    }

    pub fn add_member(&mut self, address: NodeAddr) -> bool {
        if self.is_member(address) {
            return false;
        }
        self.members
            .push(RaftMember::new(address, self.backpressure_window));
        true
    }

    pub fn remove_member(&mut self, address: NodeAddr) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.address() != address);
        self.members.len() != before
    }

    /// Last event of the local log, `None` if it is empty
    pub fn last_event(&self) -> Option<EventPointer> {
        self.log_stream.last_entry().map(|e| e.pointer())
    }

    /// Update term if the given term is higher, stepping down to follower
    pub fn update_term(&mut self, term: Term) -> bool {
        if term <= self.term {
            return false;
        }

        info!(
            "Partition {}: term {} -> {} on {}",
            self.partition_id, self.term, term, self.local
        );
        self.term = term;
        self.voted_for = None;
        self.leader = None;
        self.become_follower();
        true
    }

    pub fn become_follower(&mut self) {
        if !self.state.is_follower() {
            info!(
                "Partition {}: {} becomes follower in term {}",
                self.partition_id, self.local, self.term
            );
        }
        self.state = RaftState::Follower;
        self.clear_leadership();
    }

    /// Start a new term and vote for self
    pub fn become_candidate(&mut self) {
        self.term += 1;
        self.state = RaftState::Candidate;
        self.voted_for = Some(self.local);
        self.leader = None;
        self.clear_leadership();

        info!(
            "Partition {}: {} becomes candidate in term {}",
            self.partition_id, self.local, self.term
        );
    }

    pub fn become_leader(&mut self) {
        self.state = RaftState::Leader;
        self.leader = Some(self.local);
        self.clear_leadership();

        info!(
            "Partition {}: {} becomes leader in term {}",
            self.partition_id, self.local, self.term
        );
    }

    fn clear_leadership(&mut self) {
        self.initial_event_position = None;
        self.ready = false;
    }

    fn has_live_leader(&self) -> bool {
        self.leader.is_some() && !self.heartbeat.should_elect()
    }

    fn floor_position(&self, position: Position) -> Position {
        self.log_stream
            .floor_entry(position)
            .map_or(POSITION_NULL, |e| e.position)
    }

    /// Answer a poll without changing any state
    pub fn handle_poll(&self, request: &PollRequest) -> PollResponse {
        if request.term < self.term {
            debug!(
                "Denied poll of {} with stale term {}",
                request.candidate, request.term
            );
            return PollResponse::denied(self.term);
        }

        if self.state.is_leader() || self.has_live_leader() {
            debug!(
                "Denied poll of {}, leader {:?} is alive",
                request.candidate, self.leader
            );
            return PollResponse::denied(request.term);
        }

        if request.last_event() >= self.last_event() {
            PollResponse::granted(request.term)
        } else {
            PollResponse::denied(request.term)
        }
    }

    pub fn handle_vote(&mut self, request: &VoteRequest) -> VoteResponse {
        if request.term < self.term {
            return VoteResponse::denied(self.term);
        }
        self.update_term(request.term);

        let can_vote = self
            .voted_for
            .map_or(true, |voted| voted == request.candidate);
        let up_to_date = request.last_event() >= self.last_event();

        if can_vote && up_to_date {
            self.voted_for = Some(request.candidate);
            self.heartbeat.update_last_contact();
            info!(
                "Partition {}: granted vote to {} for term {}",
                self.partition_id, request.candidate, request.term
            );
            VoteResponse::granted(self.term)
        } else {
            debug!(
                "Denied vote to {} for term {}",
                request.candidate, request.term
            );
            VoteResponse::denied(self.term)
        }
    }

    /// Apply an append request of `leader` to the local log
    pub fn handle_append(&mut self, leader: NodeAddr, request: AppendRequest) -> AppendResponse {
        if request.term < self.term {
            debug!(
                "Rejected append of {} with stale term {}",
                leader, request.term
            );
            return AppendResponse::failed(self.term, POSITION_NULL);
        }

        if request.term > self.term {
            self.update_term(request.term);
        } else if self.state.is_leader() {
            error!(
                "Partition {}: {} claims leadership of term {} held by {}",
                self.partition_id, leader, self.term, self.local
            );
            return AppendResponse::failed(self.term, POSITION_NULL);
        } else if self.state.is_candidate() {
            self.become_follower();
        }

        if self.leader != Some(leader) {
            info!(
                "Partition {}: {} follows {} in term {}",
                self.partition_id, self.local, leader, self.term
            );
        }
        self.leader = Some(leader);
        self.heartbeat.update_last_contact();

        let previous = request.previous_event();
        if let Some(previous) = previous {
            match self.log_stream.entry(previous.position) {
                Some(entry) if entry.term == previous.term => {}
                Some(entry) => {
                    debug!(
                        "Event at {} has term {}, leader expects {}",
                        previous.position, entry.term, previous.term
                    );
                    return AppendResponse::failed(
                        self.term,
                        self.floor_position(previous.position - 1),
                    );
                }
                None => {
                    return AppendResponse::failed(
                        self.term,
                        self.floor_position(previous.position),
                    );
                }
            }
        }

        let mut matched = previous.map_or(POSITION_NULL, |p| p.position);

        if let Some(event) = request.event {
            let position = event.position;
            let present = self
                .log_stream
                .entry(position)
                .map_or(false, |existing| existing.term == event.term);

            if !present {
                let raft_event = match event.event_type {
                    EventType::Raft => match RaftEvent::from_bytes(&event.payload) {
                        Ok(raft_event) => Some(raft_event),
                        Err(e) => {
                            warn!("Undecodable raft event at {}: {}", position, e);
                            None
                        }
                    },
                    EventType::Application => None,
                };

                if let Err(e) = self
                    .log_stream
                    .append_replicated(previous.map(|p| p.position), event)
                {
                    error!(
                        "Partition {}: failed to write replicated event {}: {}",
                        self.partition_id, position, e
                    );
                    return AppendResponse::failed(self.term, matched);
                }

                if let Some(raft_event) = raft_event {
                    debug!(
                        "Partition {}: adopting members {:?}",
                        self.partition_id, raft_event.members
                    );
                    self.set_members(&raft_event.members);
                }
            }

            matched = position;
        }

        let commit_position = request.commit_position.min(matched);
        if commit_position > self.log_stream.commit_position() {
            self.log_stream.set_commit_position(commit_position);
        }

        AppendResponse::acknowledged(self.term, matched)
    }

    pub fn status(&self) -> RaftStatus {
        RaftStatus {
            partition_id: self.partition_id,
            local: self.local,
            term: self.term,
            state: self.state,
            leader: self.leader,
            members: self.cluster_addresses(),
            commit_position: self.log_stream.commit_position(),
            joined: self.joined,
            ready: self.is_ready(),
        }
    }
}
