//! Inbound subscription of the Raft
//!
//! Opens the transport subscription for the partition and forwards every
//! inbound request and message into the actor. A subscription that cannot
//! be opened, or that ends, is opened again.

use super::{ControllerEvent, RaftContext, ScheduledTimer, TimerKind};
use crate::{raft::Raft, transport::Subscription, transport::TransportError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionPhase {
    Closed,
    Opening,
    AwaitOpen,
    Open,
    AwaitRetry,
}

pub struct SubscriptionController {
    phase: SubscriptionPhase,
    generation: u64,
    opening: Option<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
    retry: Option<ScheduledTimer>,
}

impl SubscriptionController {
    pub fn new() -> Self {
        Self {
            phase: SubscriptionPhase::Closed,
            generation: 0,
            opening: None,
            forwarder: None,
            retry: None,
        }
    }

    pub fn phase(&self) -> SubscriptionPhase {
        self.phase
    }

    pub fn is_open(&self) -> bool {
        self.phase == SubscriptionPhase::Open
    }

    pub fn open(&mut self) {
        if self.phase == SubscriptionPhase::Closed {
            self.phase = SubscriptionPhase::Opening;
        }
    }

    pub fn close(&mut self) {
        if let Some(opening) = self.opening.take() {
            opening.abort();
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.retry = None;
        self.phase = SubscriptionPhase::Closed;
    }

    pub fn do_work(&mut self, raft: &Raft, ctx: &RaftContext) -> usize {
        if self.phase != SubscriptionPhase::Opening {
            return 0;
        }

        self.generation += 1;
        let generation = self.generation;
        let transport = ctx.transport().clone();
        let partition_id = raft.partition_id();
        let local = raft.local();

        self.opening = Some(ctx.spawn_event(async move {
            let result = transport.open_subscription(partition_id, local).await;
            ControllerEvent::SubscriptionOpened { generation, result }
        }));
        self.phase = SubscriptionPhase::AwaitOpen;
        1
    }

    pub fn on_opened(
        &mut self,
        ctx: &RaftContext,
        generation: u64,
        result: Result<Subscription, TransportError>,
    ) {
        if generation != self.generation || self.phase != SubscriptionPhase::AwaitOpen {
            return;
        }
        self.opening = None;

        match result {
            Ok(mut subscription) => {
                let events = ctx.events();
                self.forwarder = Some(tokio::spawn(async move {
                    while let Some(inbound) = subscription.recv().await {
                        if events.send(ControllerEvent::Inbound(inbound)).is_err() {
                            return;
                        }
                    }
                    let _ = events.send(ControllerEvent::SubscriptionClosed { generation });
                }));
                debug!("Subscription {} open", generation);
                self.phase = SubscriptionPhase::Open;
            }
            Err(e) => {
                warn!("Cannot open subscription: {}", e);
                self.retry = Some(ctx.schedule(
                    TimerKind::SubscriptionRetry,
                    ctx.config().retry_backoff(),
                ));
                self.phase = SubscriptionPhase::AwaitRetry;
            }
        }
    }

    pub fn on_closed(&mut self, generation: u64) {
        if generation == self.generation && self.phase == SubscriptionPhase::Open {
            debug!("Subscription {} ended, reopening", generation);
            self.forwarder = None;
            self.phase = SubscriptionPhase::Opening;
        }
    }

    pub fn on_timer(&mut self, kind: TimerKind, token: u64) -> bool {
        if kind != TimerKind::SubscriptionRetry || !ScheduledTimer::is(&self.retry, token) {
            return false;
        }

        self.retry = None;
        self.phase = SubscriptionPhase::Opening;
        true
    }
}

impl Default for SubscriptionController {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SubscriptionController {
    fn drop(&mut self) {
        self.close();
    }
}
