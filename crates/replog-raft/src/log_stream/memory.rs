//! In-memory log stream
//!
//! Events live in a `BTreeMap` keyed by position behind a `parking_lot`
//! lock. Appends are written immediately unless failures were injected with
//! [`MemoryLogStream::fail_next_appends`].

use super::{EventType, LogStream, LogStreamError, LogStreamReader, LoggedEvent};
use crate::{config::RaftConfig, PartitionId, Position, Term, POSITION_NULL};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::debug;

const FAILED_APPENDS_CAPACITY: usize = 64;

#[derive(Debug)]
struct LogInner {
    events: BTreeMap<Position, LoggedEvent>,

    /// Position handed out by the next local append
    next_position: Position,

    commit_position: Position,
    appender_open: bool,

    /// Number of upcoming appends that fail
    failing_appends: usize,

    max_event_size: usize,
}

impl LogInner {
    fn last_position(&self) -> Position {
        self.events
            .last_key_value()
            .map_or(POSITION_NULL, |(position, _)| *position)
    }
}

/// Log stream kept in memory
pub struct MemoryLogStream {
    partition_id: PartitionId,
    inner: Arc<RwLock<LogInner>>,
    appended: watch::Sender<Position>,
    committed: watch::Sender<Position>,
    failed: broadcast::Sender<Position>,
}

impl MemoryLogStream {
    pub fn new(partition_id: PartitionId) -> Self {
        Self::with_max_event_size(partition_id, RaftConfig::default().max_event_size)
    }

    pub fn with_max_event_size(partition_id: PartitionId, max_event_size: usize) -> Self {
        let (appended, _) = watch::channel(POSITION_NULL);
        let (committed, _) = watch::channel(POSITION_NULL);
        let (failed, _) = broadcast::channel(FAILED_APPENDS_CAPACITY);

        Self {
            partition_id,
            inner: Arc::new(RwLock::new(LogInner {
                events: BTreeMap::new(),
                next_position: 0,
                commit_position: POSITION_NULL,
                appender_open: false,
                failing_appends: 0,
                max_event_size,
            })),
            appended,
            committed,
            failed,
        }
    }

    /// Make the next `count` appends hand out a position and then fail
    pub fn fail_next_appends(&self, count: usize) {
        self.inner.write().failing_appends = count;
    }

    /// Report the write at `position` as lost after it was acknowledged
    pub fn fail_written(&self, position: Position) {
        debug!("Write at position {} reported as failed", position);
        let _ = self.failed.send(position);
    }

    /// Copy of all written events in position order
    pub fn events(&self) -> Vec<LoggedEvent> {
        self.inner.read().events.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().events.is_empty()
    }

    pub fn is_appender_open(&self) -> bool {
        self.inner.read().appender_open
    }
}

enum AppendOutcome {
    Written(Position),
    Failed(Position),
}

#[async_trait]
impl LogStream for MemoryLogStream {
    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    fn max_event_size(&self) -> usize {
        self.inner.read().max_event_size
    }

    async fn open_appender(&self) -> Result<(), LogStreamError> {
        self.inner.write().appender_open = true;
        debug!("Opened appender of partition {}", self.partition_id);
        Ok(())
    }

    fn close_appender(&self) {
        self.inner.write().appender_open = false;
    }

    fn append(
        &self,
        term: Term,
        event_type: EventType,
        payload: Vec<u8>,
    ) -> Result<Position, LogStreamError> {
        let outcome = {
            let mut inner = self.inner.write();
            if !inner.appender_open {
                return Err(LogStreamError::AppenderClosed);
            }

            let position = inner.next_position;
            let event = LoggedEvent::new(position, term, event_type, payload);
            if event.size() > inner.max_event_size {
                return Err(LogStreamError::EventTooLarge {
                    size: event.size(),
                    max: inner.max_event_size,
                });
            }

            inner.next_position += 1;
            if inner.failing_appends > 0 {
                inner.failing_appends -= 1;
                AppendOutcome::Failed(position)
            } else {
                inner.events.insert(position, event);
                AppendOutcome::Written(position)
            }
        };

        match outcome {
            AppendOutcome::Written(position) => {
                self.appended.send_replace(position);
                Ok(position)
            }
            AppendOutcome::Failed(position) => {
                debug!("Append at position {} failed", position);
                // no receiver means nobody waits for the position
                let _ = self.failed.send(position);
                Ok(position)
            }
        }
    }

    fn append_replicated(
        &self,
        previous: Option<Position>,
        event: LoggedEvent,
    ) -> Result<Position, LogStreamError> {
        let position = event.position;
        let last = {
            let mut inner = self.inner.write();

            if let Some(previous) = previous {
                if position <= previous {
                    return Err(LogStreamError::OutOfOrder { previous, position });
                }
            }
            if event.size() > inner.max_event_size {
                return Err(LogStreamError::EventTooLarge {
                    size: event.size(),
                    max: inner.max_event_size,
                });
            }

            let first_removed = previous.map_or(Position::MIN, |p| p + 1);
            if let Some((&removed, _)) = inner.events.range(first_removed..).next() {
                if removed <= inner.commit_position {
                    return Err(LogStreamError::CommittedConflict { position: removed });
                }
            }

            let truncated = inner.events.split_off(&first_removed);
            if !truncated.is_empty() {
                debug!(
                    "Truncated {} events from position {} of partition {}",
                    truncated.len(),
                    first_removed,
                    self.partition_id
                );
            }

            inner.events.insert(position, event);
            inner.next_position = inner.next_position.max(position + 1);
            inner.last_position()
        };

        self.appended.send_replace(last);
        Ok(position)
    }

    fn current_appender_position(&self) -> Position {
        self.inner.read().last_position()
    }

    fn commit_position(&self) -> Position {
        self.inner.read().commit_position
    }

    fn set_commit_position(&self, position: Position) {
        let committed = {
            let mut inner = self.inner.write();
            let position = position.min(inner.last_position());
            if position <= inner.commit_position {
                return;
            }
            inner.commit_position = position;
            position
        };

        self.committed.send_replace(committed);
    }

    fn entry(&self, position: Position) -> Option<LoggedEvent> {
        self.inner.read().events.get(&position).cloned()
    }

    fn floor_entry(&self, position: Position) -> Option<LoggedEvent> {
        self.inner
            .read()
            .events
            .range(..=position)
            .next_back()
            .map(|(_, event)| event.clone())
    }

    fn last_entry(&self) -> Option<LoggedEvent> {
        self.inner
            .read()
            .events
            .last_key_value()
            .map(|(_, event)| event.clone())
    }

    fn new_reader(&self) -> Box<dyn LogStreamReader> {
        Box::new(MemoryLogReader {
            inner: self.inner.clone(),
            next: Position::MIN,
        })
    }

    fn on_append(&self) -> watch::Receiver<Position> {
        self.appended.subscribe()
    }

    fn on_commit_position_updated(&self) -> watch::Receiver<Position> {
        self.committed.subscribe()
    }

    fn on_append_failed(&self) -> broadcast::Receiver<Position> {
        self.failed.subscribe()
    }
}

/// Cursor over a [`MemoryLogStream`]
///
/// Reads the live map, so events written after the reader was created are
/// visible to it.
pub struct MemoryLogReader {
    inner: Arc<RwLock<LogInner>>,

    /// Lowest position `next` may return
    next: Position,
}

impl LogStreamReader for MemoryLogReader {
    fn seek_to_first_event(&mut self) {
        self.next = Position::MIN;
    }

    fn seek_to_last_event(&mut self) {
        self.next = self
            .inner
            .read()
            .events
            .last_key_value()
            .map_or(Position::MIN, |(position, _)| *position);
    }

    fn seek(&mut self, position: Position) -> bool {
        self.next = position;
        self.inner.read().events.contains_key(&position)
    }

    fn has_next(&self) -> bool {
        self.inner.read().events.range(self.next..).next().is_some()
    }

    fn next(&mut self) -> Option<LoggedEvent> {
        let event = self
            .inner
            .read()
            .events
            .range(self.next..)
            .next()
            .map(|(_, event)| event.clone())?;

        self.next = event.position + 1;
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_log() -> MemoryLogStream {
        let log = MemoryLogStream::new(0);
        log.open_appender().await.unwrap();
        log
    }

    fn append(log: &MemoryLogStream, term: Term, payload: &[u8]) -> Position {
        log.append(term, EventType::Application, payload.to_vec())
            .unwrap()
    }

    #[tokio::test]
    async fn test_append_requires_open_appender() {
        let log = MemoryLogStream::new(0);
        assert!(matches!(
            log.append(1, EventType::Application, vec![]),
            Err(LogStreamError::AppenderClosed)
        ));

        log.open_appender().await.unwrap();
        assert_eq!(append(&log, 1, b"a"), 0);
        assert_eq!(append(&log, 1, b"b"), 1);
        assert_eq!(log.current_appender_position(), 1);

        log.close_appender();
        assert!(log.append(1, EventType::Application, vec![]).is_err());
    }

    #[tokio::test]
    async fn test_event_too_large() {
        let log = MemoryLogStream::with_max_event_size(0, 64);
        log.open_appender().await.unwrap();

        let result = log.append(1, EventType::Application, vec![0; 64]);
        assert!(matches!(result, Err(LogStreamError::EventTooLarge { .. })));
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_commit_position_is_clamped_and_monotonic() {
        let log = open_log().await;
        append(&log, 1, b"a");
        append(&log, 1, b"b");

        log.set_commit_position(10);
        assert_eq!(log.commit_position(), 1);

        log.set_commit_position(0);
        assert_eq!(log.commit_position(), 1);
    }

    #[tokio::test]
    async fn test_conditions_report_changes() {
        let log = open_log().await;
        let mut appended = log.on_append();
        let mut committed = log.on_commit_position_updated();

        append(&log, 1, b"a");
        appended.changed().await.unwrap();
        assert_eq!(*appended.borrow_and_update(), 0);

        log.set_commit_position(0);
        committed.changed().await.unwrap();
        assert_eq!(*committed.borrow_and_update(), 0);
    }

    #[tokio::test]
    async fn test_failed_append_is_broadcast() {
        let log = open_log().await;
        let mut failures = log.on_append_failed();
        log.fail_next_appends(1);

        let failed = append(&log, 1, b"lost");
        assert_eq!(failures.recv().await.unwrap(), failed);
        assert!(log.entry(failed).is_none());

        let written = append(&log, 1, b"kept");
        assert!(written > failed);
        assert!(log.entry(written).is_some());
    }

    #[tokio::test]
    async fn test_floor_entry_skips_gaps() {
        let log = MemoryLogStream::new(0);
        for position in [2, 5, 9] {
            let previous = log.last_entry().map(|e| e.position);
            let event = LoggedEvent::new(position, 1, EventType::Application, vec![]);
            log.append_replicated(previous, event).unwrap();
        }

        assert_eq!(log.floor_entry(10).map(|e| e.position), Some(9));
        assert_eq!(log.floor_entry(8).map(|e| e.position), Some(5));
        assert_eq!(log.floor_entry(1), None);
    }

    #[test]
    fn test_replicated_append_truncates_divergent_suffix() {
        let log = MemoryLogStream::new(0);
        log.append_replicated(None, LoggedEvent::new(0, 1, EventType::Application, vec![]))
            .unwrap();
        log.append_replicated(Some(0), LoggedEvent::new(1, 1, EventType::Application, vec![]))
            .unwrap();
        log.append_replicated(Some(1), LoggedEvent::new(2, 1, EventType::Application, vec![]))
            .unwrap();

        log.append_replicated(Some(0), LoggedEvent::new(1, 2, EventType::Application, vec![]))
            .unwrap();

        let terms: Vec<_> = log.events().iter().map(|e| (e.position, e.term)).collect();
        assert_eq!(terms, vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn test_replicated_append_never_replaces_committed_events() {
        let log = MemoryLogStream::new(0);
        log.append_replicated(None, LoggedEvent::new(0, 1, EventType::Application, vec![]))
            .unwrap();
        log.append_replicated(Some(0), LoggedEvent::new(1, 1, EventType::Application, vec![]))
            .unwrap();
        log.set_commit_position(1);

        let result =
            log.append_replicated(Some(0), LoggedEvent::new(1, 2, EventType::Application, vec![]));
        assert!(matches!(
            result,
            Err(LogStreamError::CommittedConflict { position: 1 })
        ));

        let result =
            log.append_replicated(Some(3), LoggedEvent::new(3, 2, EventType::Application, vec![]));
        assert!(matches!(result, Err(LogStreamError::OutOfOrder { .. })));
    }

    #[tokio::test]
    async fn test_reader_seek() {
        let log = open_log().await;
        for payload in [b"a", b"b", b"c"] {
            append(&log, 1, payload);
        }

        let mut reader = log.new_reader();
        assert_eq!(reader.next().map(|e| e.position), Some(0));

        assert!(reader.seek(2));
        assert_eq!(reader.next().map(|e| e.position), Some(2));
        assert!(!reader.has_next());

        append(&log, 1, b"d");
        assert!(reader.has_next());

        reader.seek_to_last_event();
        assert_eq!(reader.next().map(|e| e.position), Some(3));

        assert!(!reader.seek(7));
        reader.seek_to_first_event();
        assert_eq!(reader.next().map(|e| e.position), Some(0));
    }
}
