//! Cooperative controllers driven by the Raft actor
//!
//! Each controller is a tagged-enum state machine with a `do_work` step that
//! returns how much progress it made. The actor keeps calling `do_work` on
//! every controller until none of them makes progress, then waits for the
//! next [`ControllerEvent`].
//!
//! Anything asynchronous (requests, timers, log stream conditions) runs in a
//! spawned task that posts its outcome back into the actor's event channel.
//! The handles returned for those tasks abort them when dropped, so closing
//! a controller releases everything it started.

pub mod append_event;
pub mod commit;
pub mod configuration;
pub mod consensus;
pub mod member_change;
pub mod open_log;
pub mod replicate;
pub mod subscription;

use crate::{
    config::RaftConfig,
    log_stream::LogStreamError,
    raft::Raft,
    rpc::{Envelope, RaftMessage, RaftRequest, RaftResponse},
    transport::{Inbound, Subscription, Transport, TransportError},
    NodeAddr, Position,
};
use append_event::EventSlot;
use consensus::ConsensusKind;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Inputs of the Raft actor
#[derive(Debug)]
pub enum ControllerEvent {
    /// Request or message from another member
    Inbound(Inbound),

    SubscriptionOpened {
        generation: u64,
        result: Result<Subscription, TransportError>,
    },

    /// The forwarding task of a subscription ended
    SubscriptionClosed { generation: u64 },

    ConsensusResponse {
        kind: ConsensusKind,
        round: u64,
        member: NodeAddr,
        result: Result<RaftResponse, TransportError>,
    },

    ConfigurationResponse {
        attempt: u64,
        member: NodeAddr,
        result: Result<RaftResponse, TransportError>,
    },

    AppenderOpened {
        generation: u64,
        result: Result<(), LogStreamError>,
    },

    /// The log stream wrote up to this position
    Appended(Position),

    CommitPositionUpdated(Position),

    Timer { kind: TimerKind, token: u64 },
}

/// Owner of a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Election,
    Heartbeat,
    SubscriptionRetry,
    AppendRetry(EventSlot),
    CommitTimeout(EventSlot),
    ConfigurationRetry,
}

/// Timer that fires once unless dropped before
#[derive(Debug)]
pub struct ScheduledTimer {
    token: u64,
    handle: JoinHandle<()>,
}

impl ScheduledTimer {
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Whether a fired timer event belongs to this timer
    pub fn is(timer: &Option<ScheduledTimer>, token: u64) -> bool {
        timer.as_ref().map_or(false, |t| t.token == token)
    }
}

impl Drop for ScheduledTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Forwarding of a log stream condition into the actor
#[derive(Debug)]
pub struct ConditionRegistration {
    handle: JoinHandle<()>,
}

impl Drop for ConditionRegistration {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// In-flight requests of one controller
#[derive(Debug, Default)]
pub struct PendingRequests {
    handles: Vec<JoinHandle<()>>,
}

impl PendingRequests {
    pub fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    /// Abort every request; returns how many were still running
    pub fn release(&mut self) -> usize {
        let mut running = 0;
        for handle in self.handles.drain(..) {
            if !handle.is_finished() {
                running += 1;
            }
            handle.abort();
        }
        running
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Drop for PendingRequests {
    fn drop(&mut self) {
        self.release();
    }
}

/// Services shared by all controllers of one Raft
pub struct RaftContext {
    events: mpsc::UnboundedSender<ControllerEvent>,
    transport: Arc<dyn Transport>,
    config: RaftConfig,
    next_token: AtomicU64,
}

impl RaftContext {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: RaftConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ControllerEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let context = Self {
            events,
            transport,
            config,
            next_token: AtomicU64::new(1),
        };
        (context, receiver)
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn events(&self) -> mpsc::UnboundedSender<ControllerEvent> {
        self.events.clone()
    }

    /// Post `kind` back into the actor after `delay`
    pub fn schedule(&self, kind: TimerKind, delay: Duration) -> ScheduledTimer {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(ControllerEvent::Timer { kind, token });
        });
        ScheduledTimer { token, handle }
    }

    /// Post an event for every change of a log stream condition
    pub fn register_condition(
        &self,
        mut condition: watch::Receiver<Position>,
        map: fn(Position) -> ControllerEvent,
    ) -> ConditionRegistration {
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            while condition.changed().await.is_ok() {
                let position = *condition.borrow_and_update();
                if events.send(map(position)).is_err() {
                    break;
                }
            }
        });
        ConditionRegistration { handle }
    }

    /// Run `task` and post its outcome into the actor
    pub fn spawn_event<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ControllerEvent> + Send + 'static,
    {
        let events = self.events.clone();
        tokio::spawn(async move {
            let _ = events.send(task.await);
        })
    }

    /// Send a request and post `complete(result)` into the actor
    pub fn send_request<F>(
        &self,
        to: NodeAddr,
        request: Envelope<RaftRequest>,
        timeout: Duration,
        complete: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Result<RaftResponse, TransportError>) -> ControllerEvent + Send + 'static,
    {
        let transport = self.transport.clone();
        self.spawn_event(async move {
            let result = transport.send_request(to, request, timeout).await;
            complete(result)
        })
    }

    pub fn send_message(&self, to: NodeAddr, message: Envelope<RaftMessage>) -> bool {
        self.transport.send_message(to, message)
    }

    /// Frame `body` with the partition and sender of `raft`
    pub fn envelope<T>(&self, raft: &Raft, body: T) -> Envelope<T> {
        Envelope::new(raft.partition_id(), raft.local(), body)
    }
}
