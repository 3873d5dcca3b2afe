//! Join / leave handshake of a member with the cluster
//!
//! Requests go round-robin through the known members, or to the leader a
//! previous response pointed at. Any failure (timeout, stale or newer term,
//! rejection) waits for the retry backoff and tries again. A newer term is
//! adopted before the next request goes out.

use super::{ControllerEvent, RaftContext, ScheduledTimer, TimerKind};
use crate::{
    raft::Raft,
    rpc::{ConfigurationRequest, JoinRequest, RaftRequest, RaftResponse},
    transport::TransportError,
    NodeAddr,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationOperation {
    Join,
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationPhase {
    Closed,
    SendRequest,
    AwaitResponse,
    AwaitRetry,
    Configured,
}

pub struct ConfigurationController {
    phase: ConfigurationPhase,
    operation: ConfigurationOperation,

    /// Identifies the request in flight
    attempt: u64,

    /// Round-robin cursor over the known members
    next_member: usize,

    /// Leader named by the last response
    leader_hint: Option<NodeAddr>,

    request: Option<JoinHandle<()>>,
    retry: Option<ScheduledTimer>,
}

impl ConfigurationController {
    pub fn new() -> Self {
        Self {
            phase: ConfigurationPhase::Closed,
            operation: ConfigurationOperation::Join,
            attempt: 0,
            next_member: 0,
            leader_hint: None,
            request: None,
            retry: None,
        }
    }

    pub fn phase(&self) -> ConfigurationPhase {
        self.phase
    }

    pub fn operation(&self) -> ConfigurationOperation {
        self.operation
    }

    pub fn is_configured(&self) -> bool {
        self.phase == ConfigurationPhase::Configured
    }

    pub fn open(&mut self, operation: ConfigurationOperation) {
        self.close();
        self.operation = operation;
        self.phase = ConfigurationPhase::SendRequest;
    }

    pub fn close(&mut self) {
        if let Some(request) = self.request.take() {
            request.abort();
        }
        self.retry = None;
        self.leader_hint = None;
        self.phase = ConfigurationPhase::Closed;
    }

    pub fn on_timer(&mut self, kind: TimerKind, token: u64) -> bool {
        if kind != TimerKind::ConfigurationRetry || !ScheduledTimer::is(&self.retry, token) {
            return false;
        }

        self.retry = None;
        if self.phase == ConfigurationPhase::AwaitRetry {
            self.phase = ConfigurationPhase::SendRequest;
        }
        true
    }

    pub fn on_response(
        &mut self,
        raft: &mut Raft,
        ctx: &RaftContext,
        attempt: u64,
        member: NodeAddr,
        result: Result<RaftResponse, TransportError>,
    ) {
        if attempt != self.attempt || self.phase != ConfigurationPhase::AwaitResponse {
            return;
        }
        self.request = None;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!("{:?} request to {} failed: {}", self.operation, member, e);
                self.retry(ctx);
                return;
            }
        };

        if response.term() > raft.term() {
            debug!(
                "{:?} response of {} carries term {}, retrying with the next member",
                self.operation,
                member,
                response.term()
            );
            raft.update_term(response.term());
            self.leader_hint = None;
            self.retry(ctx);
            return;
        }

        if response.term() < raft.term() {
            debug!(
                "Stale {:?} response of {} in term {}",
                self.operation,
                member,
                response.term()
            );
            self.retry(ctx);
            return;
        }

        self.leader_hint = response.leader().filter(|leader| *leader != raft.local());

        if !response.membership_succeeded() {
            debug!(
                "{:?} rejected by {}, leader hint {:?}",
                self.operation, member, self.leader_hint
            );
            self.retry(ctx);
            return;
        }

        self.complete(raft, response.members());
    }

    pub fn do_work(&mut self, raft: &mut Raft, ctx: &RaftContext) -> usize {
        if self.phase != ConfigurationPhase::SendRequest {
            return 0;
        }

        let members = raft.member_addresses();
        if members.is_empty() {
            self.complete(raft, &[]);
            return 1;
        }

        let target = match self.leader_hint.take() {
            Some(leader) => leader,
            None => {
                let member = members[self.next_member % members.len()];
                self.next_member = self.next_member.wrapping_add(1);
                member
            }
        };

        let body = match self.operation {
            ConfigurationOperation::Join => RaftRequest::Join(JoinRequest {
                term: raft.term(),
                member: raft.local(),
            }),
            ConfigurationOperation::Leave => RaftRequest::Configuration(ConfigurationRequest {
                term: raft.term(),
                members: raft.cluster_addresses(),
                leaving: true,
            }),
        };

        self.attempt += 1;
        let attempt = self.attempt;
        debug!("Sending {:?} request to {}", self.operation, target);
        self.request = Some(ctx.send_request(
            target,
            ctx.envelope(raft, body),
            ctx.config().configuration_request_timeout(),
            move |result| ControllerEvent::ConfigurationResponse {
                attempt,
                member: target,
                result,
            },
        ));
        self.phase = ConfigurationPhase::AwaitResponse;
        1
    }

    fn retry(&mut self, ctx: &RaftContext) {
        self.retry = Some(ctx.schedule(
            TimerKind::ConfigurationRetry,
            ctx.config().retry_backoff(),
        ));
        self.phase = ConfigurationPhase::AwaitRetry;
    }

    fn complete(&mut self, raft: &mut Raft, members: &[NodeAddr]) {
        match self.operation {
            ConfigurationOperation::Join => {
                if !members.is_empty() {
                    raft.set_members(members);
                }
                raft.set_joined(true);
                info!(
                    "Partition {}: {} joined, members {:?}",
                    raft.partition_id(),
                    raft.local(),
                    raft.cluster_addresses()
                );
            }
            ConfigurationOperation::Leave => {
                raft.set_members(&[]);
                raft.set_joined(false);
                info!("Partition {}: {} left", raft.partition_id(), raft.local());
            }
        }
        self.phase = ConfigurationPhase::Configured;
    }
}

impl Default for ConfigurationController {
    fn default() -> Self {
        Self::new()
    }
}
