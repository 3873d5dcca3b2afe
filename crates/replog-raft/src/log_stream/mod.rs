//! Append-only log stream consumed by the Raft controllers
//!
//! A leader appends through an appender that has to be opened first. A
//! follower writes events it received from its leader with
//! [`LogStream::append_replicated`], which keeps the leader's positions and
//! drops an uncommitted divergent suffix.
//!
//! Changes are observable through channels:
//! - `on_append`: last written position (`watch`)
//! - `on_commit_position_updated`: commit position (`watch`)
//! - `on_append_failed`: positions of appends that were handed out but never written (`broadcast`)

pub mod memory;

use crate::{EventPointer, PartitionId, Position, Term};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};

/// Errors reported by a log stream
#[derive(Debug, Error)]
pub enum LogStreamError {
    #[error("Log appender is not open")]
    AppenderClosed,

    #[error("Event of {size} bytes exceeds the maximum of {max} bytes")]
    EventTooLarge { size: usize, max: usize },

    #[error("Committed event at position {position} cannot be replaced")]
    CommittedConflict { position: Position },

    #[error("Event at position {position} does not follow position {previous}")]
    OutOfOrder { previous: Position, position: Position },

    #[error("Log stream is closed")]
    Closed,
}

/// Who wrote an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// Internal Raft event (initial event, membership change)
    Raft,
    /// Payload appended by a client of the leader
    Application,
}

/// Single entry of the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub position: Position,
    pub term: Term,
    pub event_type: EventType,
    pub payload: Vec<u8>,
}

impl LoggedEvent {
    /// Framing bytes accounted per event on top of its payload
    pub const HEADER_LENGTH: usize = 32;

    pub fn new(position: Position, term: Term, event_type: EventType, payload: Vec<u8>) -> Self {
        Self {
            position,
            term,
            event_type,
            payload,
        }
    }

    pub fn pointer(&self) -> EventPointer {
        EventPointer::new(self.position, self.term)
    }

    /// Size of the event on the wire
    pub fn size(&self) -> usize {
        Self::HEADER_LENGTH + self.payload.len()
    }
}

/// Log storage of one partition
#[async_trait]
pub trait LogStream: Send + Sync {
    fn partition_id(&self) -> PartitionId;

    /// Largest event, header included, that appends accept
    fn max_event_size(&self) -> usize;

    /// Open the appender used by a leader
    async fn open_appender(&self) -> Result<(), LogStreamError>;

    /// Close the appender; a no-op if it is not open
    fn close_appender(&self);

    /// Append a new event in `term` and hand out its position
    ///
    /// The event is written asynchronously. Once written, `on_append`
    /// reports a position at or after it. If the write fails, the position
    /// is published through `on_append_failed` instead.
    fn append(
        &self,
        term: Term,
        event_type: EventType,
        payload: Vec<u8>,
    ) -> Result<Position, LogStreamError>;

    /// Write an event received from the leader directly after `previous`
    ///
    /// Every event after `previous` is removed first. `None` means the
    /// event starts the log.
    fn append_replicated(
        &self,
        previous: Option<Position>,
        event: LoggedEvent,
    ) -> Result<Position, LogStreamError>;

    /// Position of the last written event
    fn current_appender_position(&self) -> Position;

    fn commit_position(&self) -> Position;

    /// Raise the commit position; never moves backwards or past the last written event
    fn set_commit_position(&self, position: Position);

    /// Event at exactly `position`
    fn entry(&self, position: Position) -> Option<LoggedEvent>;

    /// Nearest event at or before `position`
    fn floor_entry(&self, position: Position) -> Option<LoggedEvent>;

    fn last_entry(&self) -> Option<LoggedEvent>;

    /// Independent cursor positioned at the first event
    fn new_reader(&self) -> Box<dyn LogStreamReader>;

    fn on_append(&self) -> watch::Receiver<Position>;

    fn on_commit_position_updated(&self) -> watch::Receiver<Position>;

    fn on_append_failed(&self) -> broadcast::Receiver<Position>;
}

/// Seekable cursor over a log stream
pub trait LogStreamReader: Send {
    fn seek_to_first_event(&mut self);

    /// Position the cursor on the last event, so that `next` returns it
    fn seek_to_last_event(&mut self);

    /// Position the cursor so that `next` returns the first event at or
    /// after `position`; true if an event exists at exactly `position`
    fn seek(&mut self, position: Position) -> bool;

    fn has_next(&self) -> bool;

    fn next(&mut self) -> Option<LoggedEvent>;
}
