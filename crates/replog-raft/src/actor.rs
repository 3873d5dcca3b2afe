//! Actor owning one Raft instance
//!
//! The actor is a single tokio task. It receives commands from
//! [`RaftHandle`]s and events from the tasks its controllers started, and
//! after each input drives all controllers until none of them makes
//! progress. The resulting [`RaftStatus`] is published through a `watch`
//! channel.

use crate::{
    config::RaftNodeConfig,
    controller::{
        append_event::EventSlot,
        commit::AdvanceCommitController,
        consensus::{ConsensusKind, ConsensusRequestController, PollRequestHandler, VoteRequestHandler},
        member_change::MemberChangeController,
        open_log::OpenLogStreamController,
        replicate::ReplicateLogController,
        subscription::SubscriptionController,
        ControllerEvent, RaftContext, ScheduledTimer, TimerKind,
    },
    join::{RaftJoinService, Waiter},
    log_stream::{EventType, LogStream},
    raft::Raft,
    rpc::{RaftMessage, RaftRequest, RaftResponse},
    state::{RaftState, RaftStatus},
    transport::{Inbound, Transport},
    NodeAddr, PartitionId, Position, RaftError, RaftResult, Term,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

const COMMAND_CAPACITY: usize = 64;

/// Requests of a [`RaftHandle`] to its actor
#[derive(Debug)]
enum RaftCommand {
    Join(Waiter),
    Leave(Waiter),
    Append {
        payload: Vec<u8>,
        reply: oneshot::Sender<RaftResult<Position>>,
    },
    Close(oneshot::Sender<()>),
}

/// Handle to a running Raft instance
///
/// Cloning the handle is cheap. The instance shuts down when it is closed
/// explicitly or when the last handle is dropped.
#[derive(Clone)]
pub struct RaftHandle {
    partition_id: PartitionId,
    local_address: NodeAddr,
    commands: mpsc::Sender<RaftCommand>,
    status: watch::Receiver<RaftStatus>,
}

impl RaftHandle {
    /// Start a Raft instance on the current tokio runtime
    pub fn spawn(
        config: RaftNodeConfig,
        log_stream: Arc<dyn LogStream>,
        transport: Arc<dyn Transport>,
    ) -> RaftResult<Self> {
        config.raft.validate()?;
        if log_stream.partition_id() != config.partition_id {
            return Err(RaftError::ConfigError(format!(
                "log stream of partition {} given to raft of partition {}",
                log_stream.partition_id(),
                config.partition_id
            )));
        }
        // a larger event could never pass the backpressure window of a link
        if log_stream.max_event_size() > config.raft.backpressure_window() {
            return Err(RaftError::ConfigError(format!(
                "log stream accepts events of {} bytes, the backpressure window is {} bytes",
                log_stream.max_event_size(),
                config.raft.backpressure_window()
            )));
        }

        let raft = Raft::new(&config, log_stream);
        let (ctx, events) = RaftContext::new(transport, config.raft.clone());
        let (status_sender, status) = watch::channel(raft.status());
        let (commands, command_receiver) = mpsc::channel(COMMAND_CAPACITY);

        info!(
            "Starting raft of partition {} on {} with members {:?}",
            config.partition_id, config.local_address, config.members
        );

        let actor = RaftActor::new(raft, ctx, events, command_receiver, status_sender);
        tokio::spawn(actor.run());

        Ok(Self {
            partition_id: config.partition_id,
            local_address: config.local_address,
            commands,
            status,
        })
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn local_address(&self) -> NodeAddr {
        self.local_address
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<RaftResult<T>>) -> RaftCommand,
    ) -> RaftResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| RaftError::Closed(self.partition_id))?;
        response
            .await
            .map_err(|_| RaftError::Closed(self.partition_id))?
    }

    /// Join the cluster through the configured members
    pub async fn join(&self) -> RaftResult<()> {
        self.request(RaftCommand::Join).await
    }

    /// Leave the cluster; fails while this node is the leader
    pub async fn leave(&self) -> RaftResult<()> {
        self.request(RaftCommand::Leave).await
    }

    /// Append an application event on the leader
    ///
    /// Returns the position the event was written at. The event is not
    /// committed yet at that point.
    pub async fn append(&self, payload: Vec<u8>) -> RaftResult<Position> {
        self.request(|reply| RaftCommand::Append { payload, reply })
            .await
    }

    /// Latest published status
    pub fn status(&self) -> RaftStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RaftStatus> {
        self.status.clone()
    }

    /// Wait until the status satisfies `predicate`
    pub async fn wait_for<F>(&self, predicate: F) -> RaftResult<RaftStatus>
    where
        F: FnMut(&RaftStatus) -> bool,
    {
        let mut status = self.status.clone();
        let matched = status
            .wait_for(predicate)
            .await
            .map_err(|_| RaftError::Closed(self.partition_id))?;
        Ok(matched.clone())
    }

    /// Stop the instance and wait until it released its resources
    pub async fn close(&self) -> RaftResult<()> {
        let (reply, closed) = oneshot::channel();
        if self.commands.send(RaftCommand::Close(reply)).await.is_err() {
            // already gone
            return Ok(());
        }
        let _ = closed.await;
        Ok(())
    }
}

struct RaftActor {
    raft: Raft,
    ctx: RaftContext,
    events: mpsc::UnboundedReceiver<ControllerEvent>,
    commands: mpsc::Receiver<RaftCommand>,
    status: watch::Sender<RaftStatus>,

    subscription: SubscriptionController,
    poll: ConsensusRequestController<PollRequestHandler>,
    vote: ConsensusRequestController<VoteRequestHandler>,
    open_log: OpenLogStreamController,
    replicate: ReplicateLogController,
    commit: AdvanceCommitController,
    member_change: MemberChangeController,
    join: RaftJoinService,

    election_timer: Option<ScheduledTimer>,

    /// Role and term the controllers are set up for
    role: (RaftState, Term),
}

impl RaftActor {
    fn new(
        raft: Raft,
        ctx: RaftContext,
        events: mpsc::UnboundedReceiver<ControllerEvent>,
        commands: mpsc::Receiver<RaftCommand>,
        status: watch::Sender<RaftStatus>,
    ) -> Self {
        let member_change = MemberChangeController::new(ctx.config().membership_commit_timeout());
        let role = (raft.state(), raft.term());

        Self {
            raft,
            ctx,
            events,
            commands,
            status,
            subscription: SubscriptionController::new(),
            poll: ConsensusRequestController::new(PollRequestHandler),
            vote: ConsensusRequestController::new(VoteRequestHandler),
            open_log: OpenLogStreamController::new(),
            replicate: ReplicateLogController::new(),
            commit: AdvanceCommitController::new(),
            member_change,
            join: RaftJoinService::new(),
            election_timer: None,
            role,
        }
    }

    async fn run(mut self) {
        self.subscription.open();
        self.drive();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(RaftCommand::Close(closed)) => {
                        self.shutdown();
                        let _ = closed.send(());
                        return;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("All handles of partition {} dropped", self.raft.partition_id());
                        self.shutdown();
                        return;
                    }
                },
                Some(event) = self.events.recv() => self.on_event(event),
            }

            self.drive();
        }
    }

    fn on_command(&mut self, command: RaftCommand) {
        match command {
            RaftCommand::Join(waiter) => self.join.join(&self.raft, waiter),
            RaftCommand::Leave(waiter) => self.join.leave(&self.raft, waiter),
            RaftCommand::Append { payload, reply } => {
                let _ = reply.send(self.append(payload));
            }
            // handled by the run loop
            RaftCommand::Close(closed) => {
                let _ = closed.send(());
            }
        }
    }

    fn append(&self, payload: Vec<u8>) -> RaftResult<Position> {
        if !self.raft.is_leader() {
            return Err(RaftError::NotLeader);
        }
        if !self.raft.is_ready() {
            return Err(RaftError::LeaderNotReady(self.raft.term()));
        }

        let position = self
            .raft
            .log_stream()
            .append(self.raft.term(), EventType::Application, payload)?;
        Ok(position)
    }

    fn on_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Inbound(inbound) => self.on_inbound(inbound),
            ControllerEvent::SubscriptionOpened { generation, result } => {
                self.subscription.on_opened(&self.ctx, generation, result)
            }
            ControllerEvent::SubscriptionClosed { generation } => {
                self.subscription.on_closed(generation)
            }
            ControllerEvent::ConsensusResponse {
                kind,
                round,
                member,
                result,
            } => {
                match kind {
                    ConsensusKind::Poll => {
                        self.poll.on_response(&mut self.raft, round, member, result)
                    }
                    ConsensusKind::Vote => {
                        self.vote.on_response(&mut self.raft, round, member, result)
                    }
                }
            }
            ControllerEvent::ConfigurationResponse {
                attempt,
                member,
                result,
            } => {
                self.join
                    .on_response(&mut self.raft, &self.ctx, attempt, member, result);
            }
            ControllerEvent::AppenderOpened { generation, result } => {
                self.open_log
                    .on_appender_opened(&mut self.raft, generation, result)
            }
            // picked up by the next drive
            ControllerEvent::Appended(_) | ControllerEvent::CommitPositionUpdated(_) => {}
            ControllerEvent::Timer { kind, token } => self.on_timer(kind, token),
        }
    }

    fn on_timer(&mut self, kind: TimerKind, token: u64) {
        match kind {
            TimerKind::Election => {
                if ScheduledTimer::is(&self.election_timer, token) {
                    self.election_timer = None;
                    self.on_election_timeout();
                }
            }
            TimerKind::Heartbeat => {
                self.replicate.on_heartbeat_timer(&self.ctx, token);
            }
            TimerKind::SubscriptionRetry => {
                self.subscription.on_timer(kind, token);
            }
            TimerKind::AppendRetry(EventSlot::Initial) | TimerKind::CommitTimeout(EventSlot::Initial) => {
                self.open_log.on_timer(kind, token);
            }
            TimerKind::AppendRetry(EventSlot::Membership)
            | TimerKind::CommitTimeout(EventSlot::Membership) => {
                self.member_change.on_timer(kind, token);
            }
            TimerKind::ConfigurationRetry => {
                self.join.on_timer(kind, token);
            }
        }
    }

    fn on_election_timeout(&mut self) {
        let raft = &self.raft;
        if !raft.state().is_follower() || !raft.joined() || !self.poll.is_closed() {
            return;
        }

        if raft.heartbeat().should_elect() {
            info!(
                "Partition {}: {} lost contact to leader {:?} in term {}, polling",
                raft.partition_id(),
                raft.local(),
                raft.leader(),
                raft.term()
            );
            self.poll.open();
        }
    }

    fn on_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Request {
                envelope,
                responder,
            } => {
                if envelope.partition_id != self.raft.partition_id() {
                    warn!(
                        "Request of {} for partition {} reached partition {}",
                        envelope.sender,
                        envelope.partition_id,
                        self.raft.partition_id()
                    );
                    return;
                }

                let sender = envelope.sender;
                match envelope.body {
                    RaftRequest::Poll(request) => {
                        let response = self.raft.handle_poll(&request);
                        let _ = responder.send(RaftResponse::Poll(response));
                    }
                    RaftRequest::Vote(request) => {
                        let response = self.raft.handle_vote(&request);
                        let _ = responder.send(RaftResponse::Vote(response));
                    }
                    request @ (RaftRequest::Join(_) | RaftRequest::Configuration(_)) => {
                        self.raft.update_term(request.term());
                        // the role may have changed
                        self.sync_role();
                        self.member_change
                            .on_request(&mut self.raft, &self.ctx, sender, request, responder);
                    }
                }
            }
            Inbound::Message(envelope) => {
                if envelope.partition_id != self.raft.partition_id() {
                    return;
                }

                let sender = envelope.sender;
                match envelope.body {
                    RaftMessage::Append(request) => {
                        let response = self.raft.handle_append(sender, request);
                        let response = self
                            .ctx
                            .envelope(&self.raft, RaftMessage::AppendResponse(response));
                        if !self.ctx.send_message(sender, response) {
                            debug!("Append response to {} refused by transport", sender);
                        }
                    }
                    RaftMessage::AppendResponse(response) => {
                        if self.raft.update_term(response.term) {
                            return;
                        }
                        if self.raft.is_leader() && response.term == self.raft.term() {
                            self.replicate
                                .on_append_response(&mut self.raft, sender, &response);
                        }
                    }
                }
            }
        }
    }

    /// Run every controller until none of them makes progress
    fn drive(&mut self) {
        loop {
            let role_changed = self.sync_role();
            let work = self.do_work();
            if work == 0 && !role_changed {
                break;
            }
        }

        self.ensure_election_timer();
        self.publish_status();
    }

    fn do_work(&mut self) -> usize {
        let mut work = self.subscription.do_work(&self.raft, &self.ctx);
        work += self.poll.do_work(&mut self.raft, &self.ctx);
        work += self.vote.do_work(&mut self.raft, &self.ctx);

        if self.raft.is_leader() {
            work += self.open_log.do_work(&mut self.raft, &self.ctx);
        }
        if self.raft.is_leader() {
            work += self.replicate.do_work(&mut self.raft, &self.ctx);
            work += self.commit.do_work(&self.raft);
            work += self.member_change.do_work(&self.raft, &self.ctx);
        }

        work + self.join.do_work(&mut self.raft, &self.ctx)
    }

    /// Open and close controllers after a change of role or term
    fn sync_role(&mut self) -> bool {
        let role = (self.raft.state(), self.raft.term());
        if role == self.role {
            return false;
        }

        let (previous_state, _) = self.role;
        if previous_state.is_leader() {
            self.close_leadership();
        }

        // rounds of the previous role are void
        self.poll.close();
        self.vote.close();
        self.election_timer = None;

        match self.raft.state() {
            RaftState::Follower => {}
            RaftState::Candidate => self.vote.open(),
            RaftState::Leader => {
                self.open_log.open();
                self.replicate.open(&mut self.raft, &self.ctx);
                self.commit.open(&self.raft, &self.ctx);
            }
        }

        self.role = role;
        true
    }

    fn close_leadership(&mut self) {
        self.open_log.close(&self.raft);
        self.replicate.close();
        self.commit.close();
        self.member_change.close(&self.raft);
    }

    fn ensure_election_timer(&mut self) {
        let raft = &self.raft;
        if !raft.state().is_follower() || !raft.joined() || !self.poll.is_closed() {
            self.election_timer = None;
            return;
        }

        if self.election_timer.is_none() {
            let delay = raft.heartbeat().time_remaining();
            self.election_timer = Some(self.ctx.schedule(TimerKind::Election, delay));
        }
    }

    fn publish_status(&self) {
        let status = self.raft.status();
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn shutdown(&mut self) {
        if self.raft.is_leader() {
            self.close_leadership();
        }
        self.subscription.close();
        self.poll.close();
        self.vote.close();
        self.join.close(&self.raft);
        self.election_timer = None;
        self.publish_status();

        info!(
            "Raft of partition {} on {} closed in term {}",
            self.raft.partition_id(),
            self.raft.local(),
            self.raft.term()
        );
    }
}
