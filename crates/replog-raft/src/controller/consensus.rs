//! Poll and vote rounds
//!
//! Both rounds share one state machine, `closed -> opening -> open ->
//! closing -> closed`. A [`ConsensusRequestHandler`] decides what is sent
//! and what happens once a quorum granted the request or every request was
//! resolved without one.

use super::{ControllerEvent, PendingRequests, RaftContext};
use crate::{
    raft::Raft,
    rpc::{PollRequest, RaftRequest, RaftResponse, VoteRequest},
    transport::TransportError,
    NodeAddr,
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusKind {
    Poll,
    Vote,
}

/// Strategy of a consensus round
pub trait ConsensusRequestHandler {
    fn kind(&self) -> ConsensusKind;

    fn create_request(&self, raft: &Raft) -> RaftRequest;

    fn is_granted(&self, response: &RaftResponse) -> bool;

    /// A quorum (self included) granted the request
    fn consensus_granted(&self, raft: &mut Raft);

    /// Every request resolved without a quorum
    fn consensus_failed(&self, raft: &mut Raft);
}

/// Pre-vote: a granted poll turns the follower into a candidate
#[derive(Debug, Default)]
pub struct PollRequestHandler;

impl ConsensusRequestHandler for PollRequestHandler {
    fn kind(&self) -> ConsensusKind {
        ConsensusKind::Poll
    }

    fn create_request(&self, raft: &Raft) -> RaftRequest {
        RaftRequest::Poll(PollRequest::new(raft.term(), raft.local(), raft.last_event()))
    }

    fn is_granted(&self, response: &RaftResponse) -> bool {
        matches!(response, RaftResponse::Poll(poll) if poll.granted)
    }

    fn consensus_granted(&self, raft: &mut Raft) {
        if raft.state().is_follower() {
            raft.become_candidate();
        }
    }

    fn consensus_failed(&self, raft: &mut Raft) {
        debug!(
            "Partition {}: poll of {} failed in term {}",
            raft.partition_id(),
            raft.local(),
            raft.term()
        );
        raft.heartbeat_mut().update_last_contact();
    }
}

/// Vote: a granted vote turns the candidate into the leader
#[derive(Debug, Default)]
pub struct VoteRequestHandler;

impl ConsensusRequestHandler for VoteRequestHandler {
    fn kind(&self) -> ConsensusKind {
        ConsensusKind::Vote
    }

    fn create_request(&self, raft: &Raft) -> RaftRequest {
        RaftRequest::Vote(VoteRequest::new(raft.term(), raft.local(), raft.last_event()))
    }

    fn is_granted(&self, response: &RaftResponse) -> bool {
        matches!(response, RaftResponse::Vote(vote) if vote.granted)
    }

    fn consensus_granted(&self, raft: &mut Raft) {
        if raft.state().is_candidate() {
            raft.become_leader();
        }
    }

    fn consensus_failed(&self, raft: &mut Raft) {
        if raft.state().is_candidate() {
            raft.become_follower();
        }
        raft.heartbeat_mut().update_last_contact();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusPhase {
    Closed,
    Opening,
    Open,
    Closing,
}

#[derive(Debug, Clone, Copy)]
enum Transition {
    Open,
    Requested,
    Resolved,
    Close,
    Closed,
}

impl ConsensusPhase {
    fn take(self, transition: Transition) -> Self {
        use ConsensusPhase::*;

        match (self, transition) {
            (Closed, Transition::Open) => Opening,
            (Opening, Transition::Requested) => Open,
            (Open, Transition::Resolved) => Closing,
            (Opening | Open, Transition::Close) => Closing,
            (Closing, Transition::Closed) => Closed,
            (phase, _) => phase,
        }
    }
}

pub struct ConsensusRequestController<H> {
    handler: H,
    phase: ConsensusPhase,

    /// Identifies the responses of the current round
    round: u64,

    /// Grants including the local node
    granted: usize,

    resolved: usize,
    requested: usize,
    requests: PendingRequests,
}

impl<H: ConsensusRequestHandler> ConsensusRequestController<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            phase: ConsensusPhase::Closed,
            round: 0,
            granted: 1,
            resolved: 0,
            requested: 0,
            requests: PendingRequests::default(),
        }
    }

    pub fn phase(&self) -> ConsensusPhase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == ConsensusPhase::Closed
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn open(&mut self) {
        if self.phase == ConsensusPhase::Closing {
            self.release();
            self.phase = self.phase.take(Transition::Closed);
        }
        self.phase = self.phase.take(Transition::Open);
    }

    pub fn close(&mut self) {
        self.phase = self.phase.take(Transition::Close);
    }

    pub fn do_work(&mut self, raft: &mut Raft, ctx: &RaftContext) -> usize {
        match self.phase {
            ConsensusPhase::Closed => 0,
            ConsensusPhase::Opening => {
                self.send_requests(raft, ctx);
                self.phase = self.phase.take(Transition::Requested);
                1
            }
            ConsensusPhase::Open => {
                if self.granted >= raft.quorum() {
                    self.handler.consensus_granted(raft);
                    self.phase = self.phase.take(Transition::Resolved);
                    1
                } else if self.resolved >= self.requested {
                    self.handler.consensus_failed(raft);
                    self.phase = self.phase.take(Transition::Resolved);
                    1
                } else {
                    0
                }
            }
            ConsensusPhase::Closing => {
                self.release();
                self.phase = self.phase.take(Transition::Closed);
                1
            }
        }
    }

    /// Count a completed request of `round`
    ///
    /// A response carrying a newer term is never counted. The local node
    /// adopts that term, becomes a follower and the round closes.
    pub fn on_response(
        &mut self,
        raft: &mut Raft,
        round: u64,
        member: NodeAddr,
        result: Result<RaftResponse, TransportError>,
    ) {
        if round != self.round || self.phase != ConsensusPhase::Open {
            debug!(
                "Ignoring {:?} response of {} from round {}",
                self.handler.kind(),
                member,
                round
            );
            return;
        }

        if let Ok(response) = &result {
            if response.term() > raft.term() {
                debug!(
                    "{:?} response of {} carries term {}, stepping down",
                    self.handler.kind(),
                    member,
                    response.term()
                );
                raft.update_term(response.term());
                self.close();
                return;
            }
        }

        self.resolved += 1;
        match result {
            Ok(response) => {
                if response.term() == raft.term() && self.handler.is_granted(&response) {
                    self.granted += 1;
                }
            }
            Err(e) => {
                debug!("{:?} request to {} failed: {}", self.handler.kind(), member, e);
            }
        }
    }

    fn send_requests(&mut self, raft: &Raft, ctx: &RaftContext) {
        let request = self.handler.create_request(raft);
        let kind = self.handler.kind();
        let round = self.round;

        for member in raft.member_addresses() {
            let handle = ctx.send_request(
                member,
                ctx.envelope(raft, request.clone()),
                ctx.config().request_timeout(),
                move |result| ControllerEvent::ConsensusResponse {
                    kind,
                    round,
                    member,
                    result,
                },
            );
            self.requests.push(handle);
            self.requested += 1;
        }

        debug!(
            "Partition {}: {:?} of {} in term {} sent to {} members",
            raft.partition_id(),
            kind,
            raft.local(),
            raft.term(),
            self.requested
        );
    }

    fn release(&mut self) {
        self.requests.release();
        self.granted = 1;
        self.resolved = 0;
        self.requested = 0;
        self.round += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{PollResponse, VoteResponse};
    use crate::testing::{addr, context, raft, ScriptedTransport};
    use crate::state::RaftState;

    fn answer_poll<H: ConsensusRequestHandler>(
        controller: &mut ConsensusRequestController<H>,
        raft: &mut Raft,
        port: u16,
        granted: bool,
    ) {
        let response = if granted {
            PollResponse::granted(raft.term())
        } else {
            PollResponse::denied(raft.term())
        };
        let round = controller.round();
        controller.on_response(raft, round, addr(port), Ok(RaftResponse::Poll(response)));
    }

    #[tokio::test]
    async fn test_quorum_minus_one_grants_never_succeed() {
        for member_count in [2u16, 3, 4, 5, 7] {
            let members = (2..=member_count).map(addr).collect();
            let (mut raft, _) = raft(members);
            let (ctx, _events) = context(ScriptedTransport::silent());
            let mut poll = ConsensusRequestController::new(PollRequestHandler);

            let quorum = raft.quorum();
            poll.open();
            poll.do_work(&mut raft, &ctx);

            // the local node counts as one grant
            for port in 2..=member_count {
                let granted = (port as usize) < quorum;
                answer_poll(&mut poll, &mut raft, port, granted);
            }
            poll.do_work(&mut raft, &ctx);

            assert_eq!(raft.state(), RaftState::Follower, "{} members", member_count);
            assert_eq!(raft.term(), 0);
        }
    }

    #[tokio::test]
    async fn test_quorum_grants_always_succeed() {
        for member_count in [1u16, 2, 3, 4, 5, 7] {
            let members = (2..=member_count).map(addr).collect();
            let (mut raft, _) = raft(members);
            let (ctx, _events) = context(ScriptedTransport::silent());
            let mut poll = ConsensusRequestController::new(PollRequestHandler);

            let quorum = raft.quorum();
            poll.open();
            poll.do_work(&mut raft, &ctx);

            for port in 2..=member_count {
                if (port as usize) <= quorum {
                    answer_poll(&mut poll, &mut raft, port, true);
                }
            }
            poll.do_work(&mut raft, &ctx);

            assert_eq!(raft.state(), RaftState::Candidate, "{} members", member_count);
            assert_eq!(raft.term(), 1);
        }
    }

    #[tokio::test]
    async fn test_response_with_other_term_is_not_counted() {
        let (mut raft, _) = raft(vec![addr(2), addr(3)]);
        let (ctx, _events) = context(ScriptedTransport::silent());
        let mut vote = ConsensusRequestController::new(VoteRequestHandler);

        raft.become_candidate();
        vote.open();
        vote.do_work(&mut raft, &ctx);

        let round = vote.round();
        vote.on_response(&mut raft, round, addr(2), Ok(RaftResponse::Vote(VoteResponse::granted(0))));
        vote.on_response(&mut raft, round, addr(3), Err(TransportError::Timeout(addr(3))));
        vote.do_work(&mut raft, &ctx);

        assert_eq!(raft.state(), RaftState::Follower);
        assert_eq!(vote.phase(), ConsensusPhase::Closing);
    }

    #[tokio::test]
    async fn test_vote_sends_request_to_every_member() {
        let transport = ScriptedTransport::new(|_, request| match request {
            RaftRequest::Vote(vote) => Ok(RaftResponse::Vote(VoteResponse::granted(vote.term))),
            _ => Err(TransportError::Closed),
        });
        let (mut raft, _) = raft(vec![addr(2), addr(3)]);
        let (ctx, mut events) = context(transport.clone());
        let mut vote = ConsensusRequestController::new(VoteRequestHandler);

        raft.become_candidate();
        vote.open();
        vote.do_work(&mut raft, &ctx);

        for _ in 0..2 {
            match crate::testing::next_event(&mut events).await {
                ControllerEvent::ConsensusResponse {
                    kind,
                    round,
                    member,
                    result,
                } => {
                    assert_eq!(kind, ConsensusKind::Vote);
                    vote.on_response(&mut raft, round, member, result);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        vote.do_work(&mut raft, &ctx);

        assert!(raft.is_leader());
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_single_node_wins_without_requests() {
        let (mut raft, _) = raft(vec![]);
        let (ctx, _events) = context(ScriptedTransport::silent());
        let mut poll = ConsensusRequestController::new(PollRequestHandler);
        let mut vote = ConsensusRequestController::new(VoteRequestHandler);

        poll.open();
        while poll.do_work(&mut raft, &ctx) > 0 {}
        assert!(raft.state().is_candidate());
        assert!(poll.is_closed());

        vote.open();
        while vote.do_work(&mut raft, &ctx) > 0 {}
        assert!(raft.is_leader());
        assert_eq!(raft.term(), 1);
    }

    #[tokio::test]
    async fn test_late_response_of_previous_round_is_ignored() {
        let (mut raft, _) = raft(vec![addr(2), addr(3)]);
        let (ctx, _events) = context(ScriptedTransport::silent());
        let mut poll = ConsensusRequestController::new(PollRequestHandler);

        poll.open();
        poll.do_work(&mut raft, &ctx);
        let first_round = poll.round();
        poll.close();
        poll.do_work(&mut raft, &ctx);
        assert!(poll.is_closed());

        poll.open();
        poll.do_work(&mut raft, &ctx);
        poll.on_response(
            &mut raft,
            first_round,
            addr(2),
            Ok(RaftResponse::Poll(PollResponse::granted(0))),
        );
        poll.do_work(&mut raft, &ctx);

        assert!(raft.state().is_follower());
        assert_eq!(poll.phase(), ConsensusPhase::Open);
    }

    #[tokio::test]
    async fn test_response_with_newer_term_steps_down() {
        let (mut raft, _) = raft(vec![addr(2), addr(3)]);
        let (ctx, _events) = context(ScriptedTransport::silent());
        let mut poll = ConsensusRequestController::new(PollRequestHandler);

        poll.open();
        poll.do_work(&mut raft, &ctx);

        // would be a quorum together with the local grant
        let round = poll.round();
        poll.on_response(&mut raft, round, addr(2), Ok(RaftResponse::Poll(PollResponse::granted(5))));
        assert_eq!(poll.phase(), ConsensusPhase::Closing);
        while poll.do_work(&mut raft, &ctx) > 0 {}

        assert!(poll.is_closed());
        assert_eq!(raft.state(), RaftState::Follower);
        assert_eq!(raft.term(), 5);
        assert_eq!(raft.voted_for(), None);
    }

    #[tokio::test]
    async fn test_vote_of_newer_term_does_not_elect() {
        let (mut raft, _) = raft(vec![addr(2), addr(3)]);
        let (ctx, _events) = context(ScriptedTransport::silent());
        let mut vote = ConsensusRequestController::new(VoteRequestHandler);

        raft.become_candidate();
        vote.open();
        vote.do_work(&mut raft, &ctx);

        let round = vote.round();
        vote.on_response(&mut raft, round, addr(2), Ok(RaftResponse::Vote(VoteResponse::granted(2))));
        vote.on_response(&mut raft, round, addr(3), Ok(RaftResponse::Vote(VoteResponse::granted(2))));
        while vote.do_work(&mut raft, &ctx) > 0 {}

        assert!(!raft.is_leader());
        assert_eq!(raft.term(), 2);
    }
}
