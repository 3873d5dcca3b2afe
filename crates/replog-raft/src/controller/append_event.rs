//! Appending a Raft event and waiting for it to commit
//!
//! `closed -> append -> awaitAppended -> awaitCommitted -> committed`
//!
//! A rejected or failed append goes through `awaitRetry` and is attempted
//! again after the retry backoff, indefinitely. Positions the log stream
//! reports as failed are remembered, so the controller never waits on one
//! of them. With a commit timeout, an event that did not commit in time is
//! appended again from scratch.

use super::{ConditionRegistration, ControllerEvent, RaftContext, ScheduledTimer, TimerKind};
use crate::{
    event::RaftEvent,
    log_stream::EventType,
    raft::Raft,
    rpc::WireMessage,
    Position,
};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, error, warn};

/// Which Raft event a controller is responsible for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSlot {
    Initial,
    Membership,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendPhase {
    Closed,
    Append,
    AwaitRetry,
    AwaitAppended,
    AwaitCommitted,
    Committed,
}

#[derive(Debug, Clone, Copy)]
enum Transition {
    Open,
    Appended,
    Failed,
    Retry,
    Written,
    Committed,
    TimedOut,
    Close,
}

impl AppendPhase {
    fn take(self, transition: Transition) -> Self {
        use AppendPhase::*;

        match (self, transition) {
            (Closed, Transition::Open) => Append,
            (Append, Transition::Appended) => AwaitAppended,
            (Append | AwaitAppended | AwaitCommitted, Transition::Failed) => AwaitRetry,
            (AwaitRetry, Transition::Retry) => Append,
            (AwaitAppended, Transition::Written) => AwaitCommitted,
            (AwaitCommitted, Transition::Committed) => Committed,
            (AwaitAppended | AwaitCommitted, Transition::TimedOut) => Append,
            (_, Transition::Close) => Closed,
            (phase, _) => phase,
        }
    }
}

pub struct AppendRaftEventController {
    slot: EventSlot,
    phase: AppendPhase,
    event: Option<RaftEvent>,
    position: Option<Position>,
    commit_timeout: Option<Duration>,

    failures: Option<broadcast::Receiver<Position>>,
    failed_positions: HashSet<Position>,

    retry_timer: Option<ScheduledTimer>,
    commit_timer: Option<ScheduledTimer>,
    appended: Option<ConditionRegistration>,
    committed: Option<ConditionRegistration>,
}

impl AppendRaftEventController {
    pub fn new(slot: EventSlot, commit_timeout: Option<Duration>) -> Self {
        Self {
            slot,
            phase: AppendPhase::Closed,
            event: None,
            position: None,
            commit_timeout,
            failures: None,
            failed_positions: HashSet::new(),
            retry_timer: None,
            commit_timer: None,
            appended: None,
            committed: None,
        }
    }

    pub fn phase(&self) -> AppendPhase {
        self.phase
    }

    /// Position of the event once it was written
    pub fn appended_position(&self) -> Option<Position> {
        match self.phase {
            AppendPhase::AwaitCommitted | AppendPhase::Committed => self.position,
            _ => None,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.phase == AppendPhase::Committed
    }

    pub fn open(&mut self, raft: &Raft, ctx: &RaftContext, event: RaftEvent) {
        self.close();

        let log = raft.log_stream();
        self.failures = Some(log.on_append_failed());
        self.appended = Some(ctx.register_condition(log.on_append(), ControllerEvent::Appended));
        self.committed = Some(ctx.register_condition(
            log.on_commit_position_updated(),
            ControllerEvent::CommitPositionUpdated,
        ));
        self.event = Some(event);
        self.phase = self.phase.take(Transition::Open);
    }

    pub fn close(&mut self) {
        self.phase = self.phase.take(Transition::Close);
        self.event = None;
        self.position = None;
        self.failures = None;
        self.failed_positions.clear();
        self.retry_timer = None;
        self.commit_timer = None;
        self.appended = None;
        self.committed = None;
    }

    /// Handle a fired timer; false if it is not one of this controller's
    pub fn on_timer(&mut self, kind: TimerKind, token: u64) -> bool {
        match kind {
            TimerKind::AppendRetry(slot)
                if slot == self.slot && ScheduledTimer::is(&self.retry_timer, token) =>
            {
                self.retry_timer = None;
                self.phase = self.phase.take(Transition::Retry);
                true
            }
            TimerKind::CommitTimeout(slot)
                if slot == self.slot && ScheduledTimer::is(&self.commit_timer, token) =>
            {
                self.commit_timer = None;
                warn!(
                    "{:?} event at {:?} did not commit in time, appending it again",
                    self.slot, self.position
                );
                self.position = None;
                self.phase = self.phase.take(Transition::TimedOut);
                true
            }
            _ => false,
        }
    }

    pub fn do_work(&mut self, raft: &Raft, ctx: &RaftContext) -> usize {
        self.collect_failures();

        match self.phase {
            AppendPhase::Append => self.append(raft, ctx),
            AppendPhase::AwaitAppended => {
                let Some(position) = self.position else {
                    return 0;
                };

                if self.failed_positions.contains(&position) {
                    warn!("Append of {:?} event at {} failed", self.slot, position);
                    self.retry(ctx);
                    1
                } else if raft.log_stream().current_appender_position() >= position {
                    debug!("{:?} event written at {}", self.slot, position);
                    self.phase = self.phase.take(Transition::Written);
                    1
                } else {
                    0
                }
            }
            AppendPhase::AwaitCommitted => {
                let Some(position) = self.position else {
                    return 0;
                };

                if self.failed_positions.contains(&position) {
                    self.retry(ctx);
                    1
                } else if raft.log_stream().commit_position() >= position {
                    debug!("{:?} event committed at {}", self.slot, position);
                    self.commit_timer = None;
                    self.phase = self.phase.take(Transition::Committed);
                    1
                } else {
                    0
                }
            }
            AppendPhase::Closed
            | AppendPhase::AwaitRetry
            | AppendPhase::Committed => 0,
        }
    }

    fn append(&mut self, raft: &Raft, ctx: &RaftContext) -> usize {
        let Some(event) = &self.event else {
            return 0;
        };

        let payload = match event.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Cannot encode {:?} event: {}", self.slot, e);
                self.retry(ctx);
                return 1;
            }
        };

        match raft
            .log_stream()
            .append(raft.term(), EventType::Raft, payload)
        {
            Ok(position) => {
                self.position = Some(position);
                if let Some(timeout) = self.commit_timeout {
                    self.commit_timer = Some(ctx.schedule(TimerKind::CommitTimeout(self.slot), timeout));
                }
                self.phase = self.phase.take(Transition::Appended);
            }
            Err(e) => {
                warn!(
                    "Partition {}: cannot append {:?} event: {}",
                    raft.partition_id(),
                    self.slot,
                    e
                );
                self.retry(ctx);
            }
        }
        1
    }

    fn retry(&mut self, ctx: &RaftContext) {
        self.commit_timer = None;
        self.position = None;
        self.retry_timer = Some(ctx.schedule(
            TimerKind::AppendRetry(self.slot),
            ctx.config().retry_backoff(),
        ));
        self.phase = self.phase.take(Transition::Failed);
    }

    fn collect_failures(&mut self) {
        let Some(failures) = self.failures.as_mut() else {
            return;
        };

        loop {
            match failures.try_recv() {
                Ok(position) => {
                    self.failed_positions.insert(position);
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Missed {} failed append notifications", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }
}
