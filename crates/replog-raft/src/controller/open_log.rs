//! Term bootstrap of a new leader
//!
//! `closed -> openLogController -> awaitOpenLogController ->
//! appendInitialEvent -> awaitInitialEventAppended ->
//! awaitInitialEventCommitted -> committed`
//!
//! The leader becomes usable only in `committed`. Failing to open the
//! appender makes the node step down.

use super::{
    append_event::{AppendRaftEventController, EventSlot},
    ControllerEvent, RaftContext, TimerKind,
};
use crate::{event::RaftEvent, log_stream::LogStreamError, raft::Raft};
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenLogPhase {
    Closed,
    OpenLogController,
    AwaitOpenLogController,
    AppendInitialEvent,
    AwaitInitialEventAppended,
    AwaitInitialEventCommitted,
    Committed,
}

#[derive(Debug, Clone, Copy)]
enum Transition {
    Open,
    Opening,
    Opened,
    Appending,
    Appended,
    Committed,
    Close,
}

impl OpenLogPhase {
    fn take(self, transition: Transition) -> Self {
        use OpenLogPhase::*;

        match (self, transition) {
            (Closed, Transition::Open) => OpenLogController,
            (OpenLogController, Transition::Opening) => AwaitOpenLogController,
            (AwaitOpenLogController, Transition::Opened) => AppendInitialEvent,
            (AppendInitialEvent, Transition::Appending) => AwaitInitialEventAppended,
            (AwaitInitialEventAppended, Transition::Appended) => AwaitInitialEventCommitted,
            (AwaitInitialEventCommitted, Transition::Committed) => Committed,
            (_, Transition::Close) => Closed,
            (phase, _) => phase,
        }
    }
}

pub struct OpenLogStreamController {
    phase: OpenLogPhase,

    /// Identifies the current open attempt
    generation: u64,

    opening: Option<JoinHandle<()>>,
    initial_event: AppendRaftEventController,
}

impl OpenLogStreamController {
    pub fn new() -> Self {
        Self {
            phase: OpenLogPhase::Closed,
            generation: 0,
            opening: None,
            initial_event: AppendRaftEventController::new(EventSlot::Initial, None),
        }
    }

    pub fn phase(&self) -> OpenLogPhase {
        self.phase
    }

    pub fn is_committed(&self) -> bool {
        self.phase == OpenLogPhase::Committed
    }

    pub fn open(&mut self) {
        self.phase = self.phase.take(Transition::Open);
    }

    /// Stop bootstrapping and close the appender
    pub fn close(&mut self, raft: &Raft) {
        if self.phase == OpenLogPhase::Closed {
            return;
        }

        if let Some(opening) = self.opening.take() {
            opening.abort();
        }
        self.initial_event.close();
        raft.log_stream().close_appender();
        self.phase = self.phase.take(Transition::Close);
    }

    pub fn on_appender_opened(
        &mut self,
        raft: &mut Raft,
        generation: u64,
        result: Result<(), LogStreamError>,
    ) {
        if generation != self.generation || self.phase != OpenLogPhase::AwaitOpenLogController {
            return;
        }
        self.opening = None;

        match result {
            Ok(()) => self.phase = self.phase.take(Transition::Opened),
            Err(e) => {
                error!(
                    "Partition {}: cannot open log appender in term {}: {}",
                    raft.partition_id(),
                    raft.term(),
                    e
                );
                raft.become_follower();
            }
        }
    }

    pub fn on_timer(&mut self, kind: TimerKind, token: u64) -> bool {
        self.initial_event.on_timer(kind, token)
    }

    pub fn do_work(&mut self, raft: &mut Raft, ctx: &RaftContext) -> usize {
        match self.phase {
            OpenLogPhase::Closed
            | OpenLogPhase::AwaitOpenLogController
            | OpenLogPhase::Committed => 0,
            OpenLogPhase::OpenLogController => {
                self.generation += 1;
                let generation = self.generation;
                let log = raft.log_stream().clone();
                self.opening = Some(ctx.spawn_event(async move {
                    let result = log.open_appender().await;
                    ControllerEvent::AppenderOpened { generation, result }
                }));
                self.phase = self.phase.take(Transition::Opening);
                1
            }
            OpenLogPhase::AppendInitialEvent => {
                let event = RaftEvent::initial(raft.term(), raft.cluster_addresses());
                self.initial_event.open(raft, ctx, event);
                self.phase = self.phase.take(Transition::Appending);
                1
            }
            OpenLogPhase::AwaitInitialEventAppended => {
                let work = self.initial_event.do_work(raft, ctx);
                match self.initial_event.appended_position() {
                    Some(position) => {
                        raft.set_initial_event_position(position);
                        self.phase = self.phase.take(Transition::Appended);
                        work + 1
                    }
                    None => work,
                }
            }
            OpenLogPhase::AwaitInitialEventCommitted => {
                let work = self.initial_event.do_work(raft, ctx);
                if self.initial_event.is_committed() {
                    raft.set_ready();
                    self.phase = self.phase.take(Transition::Committed);
                    info!(
                        "Partition {}: leader {} ready in term {}",
                        raft.partition_id(),
                        raft.local(),
                        raft.term()
                    );
                    work + 1
                } else {
                    // a failed append is retried at a new position
                    match self.initial_event.appended_position() {
                        Some(position) => raft.set_initial_event_position(position),
                        None => raft.clear_initial_event_position(),
                    }
                    work
                }
            }
        }
    }
}

impl Default for OpenLogStreamController {
    fn default() -> Self {
        Self::new()
    }
}
