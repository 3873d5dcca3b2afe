//! Join and leave operations requested through a [`crate::RaftHandle`]
//!
//! Callers waiting for the same operation share one handshake. Joining a
//! cluster the node is already part of succeeds right away; so does leaving
//! one it is not part of.

use crate::{
    controller::{
        configuration::{ConfigurationController, ConfigurationOperation},
        RaftContext, TimerKind,
    },
    raft::Raft,
    rpc::RaftResponse,
    transport::TransportError,
    NodeAddr, RaftError, RaftResult,
};
use tokio::sync::oneshot;
use tracing::info;

pub type Waiter = oneshot::Sender<RaftResult<()>>;

pub struct RaftJoinService {
    configuration: ConfigurationController,
    operation: Option<ConfigurationOperation>,
    waiters: Vec<Waiter>,
}

impl RaftJoinService {
    pub fn new() -> Self {
        Self {
            configuration: ConfigurationController::new(),
            operation: None,
            waiters: Vec::new(),
        }
    }

    /// Operation in flight
    pub fn operation(&self) -> Option<ConfigurationOperation> {
        self.operation
    }

    pub fn join(&mut self, raft: &Raft, waiter: Waiter) {
        match self.operation {
            Some(ConfigurationOperation::Join) => self.waiters.push(waiter),
            Some(ConfigurationOperation::Leave) => {
                let _ = waiter.send(Err(RaftError::MembershipChange(
                    "a leave is in progress".to_string(),
                )));
            }
            None if raft.joined() => {
                let _ = waiter.send(Ok(()));
            }
            None => self.start(ConfigurationOperation::Join, waiter),
        }
    }

    pub fn leave(&mut self, raft: &Raft, waiter: Waiter) {
        if raft.is_leader() {
            let _ = waiter.send(Err(RaftError::LeaveWhileLeader));
            return;
        }

        match self.operation {
            Some(ConfigurationOperation::Leave) => self.waiters.push(waiter),
            Some(ConfigurationOperation::Join) => {
                let _ = waiter.send(Err(RaftError::MembershipChange(
                    "a join is in progress".to_string(),
                )));
            }
            None if !raft.joined() => {
                let _ = waiter.send(Ok(()));
            }
            None => self.start(ConfigurationOperation::Leave, waiter),
        }
    }

    fn start(&mut self, operation: ConfigurationOperation, waiter: Waiter) {
        info!("Starting {:?}", operation);
        self.operation = Some(operation);
        self.waiters.push(waiter);
        self.configuration.open(operation);
    }

    pub fn on_response(
        &mut self,
        raft: &mut Raft,
        ctx: &RaftContext,
        attempt: u64,
        member: NodeAddr,
        result: Result<RaftResponse, TransportError>,
    ) {
        self.configuration
            .on_response(raft, ctx, attempt, member, result);
    }

    pub fn on_timer(&mut self, kind: TimerKind, token: u64) -> bool {
        self.configuration.on_timer(kind, token)
    }

    pub fn do_work(&mut self, raft: &mut Raft, ctx: &RaftContext) -> usize {
        if self.operation.is_none() {
            return 0;
        }

        let work = self.configuration.do_work(raft, ctx);
        if !self.configuration.is_configured() {
            return work;
        }

        self.configuration.close();
        self.operation = None;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        work + 1
    }

    /// Abandon the operation in flight
    pub fn close(&mut self, raft: &Raft) {
        self.configuration.close();
        self.operation = None;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(RaftError::Closed(raft.partition_id())));
        }
    }
}

impl Default for RaftJoinService {
    fn default() -> Self {
        Self::new()
    }
}
