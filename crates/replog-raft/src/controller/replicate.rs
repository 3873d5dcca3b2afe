//! Log replication from the leader to every member
//!
//! Each member gets its own cursor over the leader's log. Events are sent
//! one per append request, chained by the previous event's position and
//! term, as long as the member's backpressure window admits them. An event
//! the transport refused is buffered and sent before anything newer.
//!
//! A member acknowledges the highest position it matched, or reports the
//! position to resume from; the cursor then restarts after the nearest
//! event at or before that position.

use super::{ConditionRegistration, ControllerEvent, RaftContext, ScheduledTimer, TimerKind};
use crate::{
    log_stream::{LogStream, LogStreamReader, LoggedEvent},
    raft::Raft,
    rpc::{AppendRequest, AppendResponse, Envelope, RaftMessage},
    state::RaftMember,
    NodeAddr, PartitionId, Position, Term,
};
use tracing::debug;

/// Leader state shared by all sends of one `do_work` pass
pub struct ReplicationLink<'a> {
    ctx: &'a RaftContext,
    partition_id: PartitionId,
    local: NodeAddr,
    term: Term,
    commit_position: Position,
}

impl<'a> ReplicationLink<'a> {
    pub fn new(raft: &Raft, ctx: &'a RaftContext) -> Self {
        Self {
            ctx,
            partition_id: raft.partition_id(),
            local: raft.local(),
            term: raft.term(),
            commit_position: raft.log_stream().commit_position(),
        }
    }

    fn send(&self, to: NodeAddr, request: AppendRequest) -> bool {
        let envelope = Envelope::new(self.partition_id, self.local, RaftMessage::Append(request));
        self.ctx.send_message(to, envelope)
    }
}

/// Send loop towards a single member
pub struct MemberReplicateLogController {
    address: NodeAddr,
    reader: Box<dyn LogStreamReader>,

    /// Event the transport refused
    buffered: Option<LoggedEvent>,

    heartbeat_due: bool,

    /// Failure position the cursor was last reset to
    last_reset: Option<Position>,
}

impl MemberReplicateLogController {
    /// Start replicating to `member` after the last event of `log`
    pub fn new(member: &mut RaftMember, log: &dyn LogStream) -> Self {
        let mut controller = Self {
            address: member.address(),
            reader: log.new_reader(),
            buffered: None,
            heartbeat_due: true,
            last_reset: None,
        };
        controller.reset_to_end(member, log);
        controller
    }

    pub fn address(&self) -> NodeAddr {
        self.address
    }

    pub fn heartbeat_due(&self) -> bool {
        self.heartbeat_due
    }

    fn reset_to_end(&mut self, member: &mut RaftMember, log: &dyn LogStream) {
        let last = log.last_entry();
        match &last {
            Some(event) => {
                self.reader.seek(event.position + 1);
            }
            None => self.reader.seek_to_first_event(),
        }
        member.reset_replication(last.map(|event| event.pointer()));
        self.buffered = None;
        self.last_reset = None;
    }

    pub fn on_acknowledged(&mut self, member: &mut RaftMember, position: Position) {
        member.update_match_position(position);
        member.backpressure_mut().on_ack(position);
        member.reset_failures();
        self.last_reset = None;
    }

    /// Restart after the nearest event at or before `position`
    ///
    /// Returns false for a repeated report of the position the cursor was
    /// already reset to.
    pub fn on_failure(&mut self, member: &mut RaftMember, log: &dyn LogStream, position: Position) -> bool {
        if self.last_reset == Some(position) {
            return false;
        }

        member.increment_failures();
        let previous = log.floor_entry(position);
        match &previous {
            Some(event) => {
                self.reader.seek(event.position + 1);
            }
            None => self.reader.seek_to_first_event(),
        }
        member.set_previous(previous.map(|event| event.pointer()));
        member.backpressure_mut().reset();
        self.buffered = None;
        self.last_reset = Some(position);

        debug!(
            "Replication to {} resumes after {} ({} failures)",
            self.address,
            member.previous_position(),
            member.failures()
        );
        true
    }

    pub fn do_work(&mut self, member: &mut RaftMember, link: &ReplicationLink<'_>) -> usize {
        let mut sent = 0;

        loop {
            let event = match self.buffered.take() {
                Some(event) => event,
                None => match self.reader.next() {
                    Some(event) => event,
                    None => break,
                },
            };

            let size = event.size();
            if !member.backpressure().can_send(size) {
                let backpressure = member.backpressure();
                debug!(
                    "Event {} to {} waits, {} of {} bytes in flight",
                    event.position,
                    self.address,
                    backpressure.in_flight_bytes(),
                    backpressure.window()
                );
                self.buffered = Some(event);
                break;
            }

            let request = AppendRequest::new(
                link.term,
                member.previous(),
                link.commit_position,
                Some(event.clone()),
            );
            if !link.send(self.address, request) {
                self.buffered = Some(event);
                break;
            }

            member.backpressure_mut().reserve(event.position, size);
            member.set_previous(Some(event.pointer()));
            sent += 1;
        }

        if self.heartbeat_due {
            if sent > 0 {
                self.heartbeat_due = false;
            } else {
                let heartbeat =
                    AppendRequest::new(link.term, member.previous(), link.commit_position, None);
                if link.send(self.address, heartbeat) {
                    self.heartbeat_due = false;
                    self.last_reset = None;
                    sent += 1;
                }
            }
        }

        sent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatePhase {
    Closed,
    Open,
}

pub struct ReplicateLogController {
    phase: ReplicatePhase,
    members: Vec<MemberReplicateLogController>,
    heartbeat: Option<ScheduledTimer>,
    appended: Option<ConditionRegistration>,
}

impl ReplicateLogController {
    pub fn new() -> Self {
        Self {
            phase: ReplicatePhase::Closed,
            members: Vec::new(),
            heartbeat: None,
            appended: None,
        }
    }

    pub fn phase(&self) -> ReplicatePhase {
        self.phase
    }

    /// Reset every member cursor to the end of the log and start sending
    pub fn open(&mut self, raft: &mut Raft, ctx: &RaftContext) {
        if self.phase == ReplicatePhase::Open {
            return;
        }

        let log = raft.log_stream().clone();
        self.members = raft
            .members_mut()
            .iter_mut()
            .map(|member| MemberReplicateLogController::new(member, log.as_ref()))
            .collect();
        self.heartbeat = Some(ctx.schedule(TimerKind::Heartbeat, ctx.config().heartbeat_interval()));
        self.appended = Some(ctx.register_condition(log.on_append(), ControllerEvent::Appended));
        self.phase = ReplicatePhase::Open;
    }

    pub fn close(&mut self) {
        self.members.clear();
        self.heartbeat = None;
        self.appended = None;
        self.phase = ReplicatePhase::Closed;
    }

    pub fn on_heartbeat_timer(&mut self, ctx: &RaftContext, token: u64) -> bool {
        if !ScheduledTimer::is(&self.heartbeat, token) {
            return false;
        }

        for member in &mut self.members {
            member.heartbeat_due = true;
        }
        self.heartbeat = Some(ctx.schedule(TimerKind::Heartbeat, ctx.config().heartbeat_interval()));
        true
    }

    pub fn on_append_response(&mut self, raft: &mut Raft, from: NodeAddr, response: &AppendResponse) {
        if self.phase == ReplicatePhase::Closed {
            return;
        }

        let log = raft.log_stream().clone();
        let Some(controller) = self.members.iter_mut().find(|c| c.address == from) else {
            debug!("Append response from unknown member {}", from);
            return;
        };
        let Some(member) = raft.member_mut(from) else {
            return;
        };

        if response.succeeded {
            controller.on_acknowledged(member, response.position);
        } else {
            controller.on_failure(member, log.as_ref(), response.position);
        }
    }

    pub fn do_work(&mut self, raft: &mut Raft, ctx: &RaftContext) -> usize {
        if self.phase == ReplicatePhase::Closed {
            return 0;
        }

        self.sync_members(raft);

        let link = ReplicationLink::new(raft, ctx);
        let mut work = 0;
        for member in raft.members_mut() {
            if let Some(controller) = self.members.iter_mut().find(|c| c.address == member.address()) {
                work += controller.do_work(member, &link);
            }
        }
        work
    }

    /// Follow changes of the member list
    fn sync_members(&mut self, raft: &mut Raft) {
        let log = raft.log_stream().clone();

        self.members
            .retain(|controller| raft.members().iter().any(|m| m.address() == controller.address));

        for member in raft.members_mut() {
            if !self.members.iter().any(|c| c.address == member.address()) {
                debug!("Starting replication to {}", member.address());
                self.members
                    .push(MemberReplicateLogController::new(member, log.as_ref()));
            }
        }
    }
}

impl Default for ReplicateLogController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RaftConfig, RaftNodeConfig};
    use crate::log_stream::{memory::MemoryLogStream, EventType};
    use crate::testing::{addr, context, raft, ScriptedTransport};
    use crate::POSITION_NULL;
    use std::sync::Arc;

    const KB: usize = 1024;

    async fn leader(raft_and_log: (Raft, Arc<MemoryLogStream>)) -> (Raft, Arc<MemoryLogStream>) {
        let (mut raft, log) = raft_and_log;
        raft.become_candidate();
        raft.become_leader();
        log.open_appender().await.unwrap();
        (raft, log)
    }

    fn appends(messages: Vec<(NodeAddr, RaftMessage)>, to: NodeAddr) -> Vec<AppendRequest> {
        messages
            .into_iter()
            .filter(|(address, _)| *address == to)
            .filter_map(|(_, message)| match message {
                RaftMessage::Append(request) => Some(request),
                RaftMessage::AppendResponse(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_opening_sends_heartbeats() {
        let (mut raft, _log) = leader(raft(vec![addr(2), addr(3)])).await;
        let transport = ScriptedTransport::silent();
        let (ctx, _events) = context(transport.clone());
        let mut replicate = ReplicateLogController::new();

        replicate.open(&mut raft, &ctx);
        assert_eq!(replicate.do_work(&mut raft, &ctx), 2);

        for member in [addr(2), addr(3)] {
            let requests = appends(transport.messages(), member);
            assert_eq!(requests.len(), 1);
            assert!(requests[0].is_heartbeat());
            assert_eq!(requests[0].previous_event(), None);
        }

        // nothing new to send
        assert_eq!(replicate.do_work(&mut raft, &ctx), 0);
    }

    #[tokio::test]
    async fn test_events_are_chained_in_order() {
        let (mut raft, log) = leader(raft(vec![addr(2)])).await;
        let transport = ScriptedTransport::silent();
        let (ctx, _events) = context(transport.clone());
        let mut replicate = ReplicateLogController::new();
        replicate.open(&mut raft, &ctx);
        replicate.do_work(&mut raft, &ctx);
        transport.take_messages();

        for payload in [b"a", b"b", b"c"] {
            log.append(raft.term(), EventType::Application, payload.to_vec())
                .unwrap();
        }
        assert_eq!(replicate.do_work(&mut raft, &ctx), 3);

        let requests = appends(transport.take_messages(), addr(2));
        let chain: Vec<_> = requests
            .iter()
            .map(|r| (r.previous_event_position, r.event.as_ref().map(|e| e.position)))
            .collect();
        assert_eq!(chain, vec![(POSITION_NULL, Some(0)), (0, Some(1)), (1, Some(2))]);
    }

    #[tokio::test]
    async fn test_backpressure_withholds_event_until_ack() {
        let config = RaftNodeConfig::new(0, addr(1), vec![addr(2)]).with_raft_config(RaftConfig {
            receive_buffer_size: 2 * 1024 * KB,
            ..RaftConfig::default()
        });
        let log = Arc::new(MemoryLogStream::new(0));
        let (mut raft, log) = leader((Raft::new(&config, log.clone()), log)).await;
        let transport = ScriptedTransport::silent();
        let (ctx, _events) = context(transport.clone());
        let mut replicate = ReplicateLogController::new();
        replicate.open(&mut raft, &ctx);
        replicate.do_work(&mut raft, &ctx);
        transport.take_messages();

        let first = log.append(1, EventType::Application, vec![0; 600 * KB]).unwrap();
        let second = log.append(1, EventType::Application, vec![0; 600 * KB]).unwrap();

        assert_eq!(replicate.do_work(&mut raft, &ctx), 1);
        assert_eq!(replicate.do_work(&mut raft, &ctx), 0);
        let sent = appends(transport.take_messages(), addr(2));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event.as_ref().map(|e| e.position), Some(first));

        replicate.on_append_response(&mut raft, addr(2), &AppendResponse::acknowledged(1, first));
        assert_eq!(raft.members()[0].match_position(), first);

        assert_eq!(replicate.do_work(&mut raft, &ctx), 1);
        let sent = appends(transport.take_messages(), addr(2));
        assert_eq!(sent[0].event.as_ref().map(|e| e.position), Some(second));
    }

    #[tokio::test]
    async fn test_failure_resumes_after_nearest_earlier_event() {
        let (raft, log) = raft(vec![addr(2)]);
        for position in [0, 3, 7, 9, 12, 15] {
            let previous = log.last_entry().map(|e| e.position);
            log.append_replicated(previous, LoggedEvent::new(position, 1, EventType::Application, vec![]))
                .unwrap();
        }
        let (mut raft, _log) = leader((raft, log)).await;
        let transport = ScriptedTransport::silent();
        let (ctx, _events) = context(transport.clone());
        let mut replicate = ReplicateLogController::new();
        replicate.open(&mut raft, &ctx);
        replicate.do_work(&mut raft, &ctx);
        transport.take_messages();

        replicate.on_append_response(&mut raft, addr(2), &AppendResponse::failed(1, 10));
        replicate.do_work(&mut raft, &ctx);

        let requests = appends(transport.take_messages(), addr(2));
        let chain: Vec<_> = requests
            .iter()
            .map(|r| (r.previous_event_position, r.event.as_ref().map(|e| e.position)))
            .collect();
        assert_eq!(chain, vec![(9, Some(12)), (12, Some(15))]);
        assert_eq!(raft.members()[0].failures(), 1);

        // the same report again, e.g. for a later event already in flight
        replicate.on_append_response(&mut raft, addr(2), &AppendResponse::failed(1, 10));
        assert_eq!(replicate.do_work(&mut raft, &ctx), 0);
    }

    #[tokio::test]
    async fn test_failure_before_first_event_restarts_from_beginning() {
        let (mut raft, log) = leader(raft(vec![addr(2)])).await;
        log.append(1, EventType::Application, vec![1]).unwrap();
        log.append(1, EventType::Application, vec![2]).unwrap();
        let transport = ScriptedTransport::silent();
        let (ctx, _events) = context(transport.clone());
        let mut replicate = ReplicateLogController::new();
        replicate.open(&mut raft, &ctx);
        replicate.do_work(&mut raft, &ctx);
        transport.take_messages();

        replicate.on_append_response(&mut raft, addr(2), &AppendResponse::failed(1, POSITION_NULL));
        replicate.do_work(&mut raft, &ctx);

        let requests = appends(transport.take_messages(), addr(2));
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].previous_event(), None);
    }

    #[tokio::test]
    async fn test_refused_event_is_sent_first() {
        let (mut raft, log) = leader(raft(vec![addr(2)])).await;
        let transport = ScriptedTransport::silent();
        let (ctx, _events) = context(transport.clone());
        let mut replicate = ReplicateLogController::new();
        replicate.open(&mut raft, &ctx);
        replicate.do_work(&mut raft, &ctx);
        transport.take_messages();

        transport.set_accept_messages(false);
        log.append(1, EventType::Application, vec![1]).unwrap();
        assert_eq!(replicate.do_work(&mut raft, &ctx), 0);

        log.append(1, EventType::Application, vec![2]).unwrap();
        transport.set_accept_messages(true);
        assert_eq!(replicate.do_work(&mut raft, &ctx), 2);

        let positions: Vec<_> = appends(transport.take_messages(), addr(2))
            .iter()
            .filter_map(|r| r.event.as_ref().map(|e| e.position))
            .collect();
        assert_eq!(positions, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_new_member_is_picked_up() {
        let (mut raft, _log) = leader(raft(vec![addr(2)])).await;
        let transport = ScriptedTransport::silent();
        let (ctx, _events) = context(transport.clone());
        let mut replicate = ReplicateLogController::new();
        replicate.open(&mut raft, &ctx);
        replicate.do_work(&mut raft, &ctx);
        transport.take_messages();

        raft.add_member(addr(3));
        assert_eq!(replicate.do_work(&mut raft, &ctx), 1);
        assert_eq!(appends(transport.take_messages(), addr(3)).len(), 1);

        raft.remove_member(addr(2));
        replicate.do_work(&mut raft, &ctx);
        assert!(replicate.members.iter().all(|c| c.address() != addr(2)));
    }
}
