//! Join and leave requests arriving at the leader
//!
//! Only a leader that committed its term-initial event changes the member
//! list, and only one change is in flight at a time. The new member list is
//! effective as soon as it is appended; the requester is answered once the
//! membership event committed.

use super::{
    append_event::{AppendRaftEventController, EventSlot},
    RaftContext, TimerKind,
};
use crate::{
    event::RaftEvent,
    raft::Raft,
    rpc::{ConfigurationResponse, JoinResponse, RaftRequest, RaftResponse},
    NodeAddr,
};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Shape of the response a change is answered with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Join,
    Configuration,
}

impl ChangeKind {
    fn response(self, raft: &Raft, succeeded: bool) -> RaftResponse {
        let term = raft.term();
        let members = raft.cluster_addresses();
        let leader = raft.leader();

        match self {
            ChangeKind::Join => RaftResponse::Join(JoinResponse {
                term,
                succeeded,
                members,
                leader,
            }),
            ChangeKind::Configuration => RaftResponse::Configuration(ConfigurationResponse {
                term,
                succeeded,
                members,
                leader,
            }),
        }
    }
}

struct PendingChange {
    kind: ChangeKind,
    member: NodeAddr,
    responder: oneshot::Sender<RaftResponse>,
}

pub struct MemberChangeController {
    pending: Option<PendingChange>,
    append: AppendRaftEventController,
}

impl MemberChangeController {
    pub fn new(commit_timeout: Duration) -> Self {
        Self {
            pending: None,
            append: AppendRaftEventController::new(EventSlot::Membership, Some(commit_timeout)),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Handle a `Join` or `Configuration` request from `sender`
    pub fn on_request(
        &mut self,
        raft: &mut Raft,
        ctx: &RaftContext,
        sender: NodeAddr,
        request: RaftRequest,
        responder: oneshot::Sender<RaftResponse>,
    ) {
        let (kind, member, joining) = match request {
            RaftRequest::Join(request) => (ChangeKind::Join, request.member, true),
            RaftRequest::Configuration(request) => {
                (ChangeKind::Configuration, sender, !request.leaving)
            }
            RaftRequest::Vote(_) | RaftRequest::Poll(_) => return,
        };

        if !raft.is_ready() || self.pending.is_some() {
            debug!(
                "Partition {}: rejecting change of {} (leader {:?}, ready {}, pending {})",
                raft.partition_id(),
                member,
                raft.leader(),
                raft.is_ready(),
                self.pending.is_some()
            );
            let _ = responder.send(kind.response(raft, false));
            return;
        }

        if joining == raft.is_member(member) {
            let _ = responder.send(kind.response(raft, true));
            return;
        }

        if joining {
            raft.add_member(member);
        } else {
            raft.remove_member(member);
        }
        info!(
            "Partition {}: {} {} in term {}, members {:?}",
            raft.partition_id(),
            member,
            if joining { "joins" } else { "leaves" },
            raft.term(),
            raft.cluster_addresses()
        );

        let event = RaftEvent::members_changed(raft.term(), raft.cluster_addresses());
        self.append.open(raft, ctx, event);
        self.pending = Some(PendingChange {
            kind,
            member,
            responder,
        });
    }

    pub fn on_timer(&mut self, kind: TimerKind, token: u64) -> bool {
        self.append.on_timer(kind, token)
    }

    pub fn do_work(&mut self, raft: &Raft, ctx: &RaftContext) -> usize {
        if self.pending.is_none() {
            return 0;
        }

        let work = self.append.do_work(raft, ctx);
        if !self.append.is_committed() {
            return work;
        }

        self.append.close();
        if let Some(pending) = self.pending.take() {
            debug!("Membership change of {} committed", pending.member);
            let _ = pending.responder.send(pending.kind.response(raft, true));
        }
        work + 1
    }

    /// Give up the change in flight, answering it as failed
    pub fn close(&mut self, raft: &Raft) {
        self.append.close();
        if let Some(pending) = self.pending.take() {
            let _ = pending.responder.send(pending.kind.response(raft, false));
        }
    }
}
