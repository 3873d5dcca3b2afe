//! Flow control for a single replication link
//!
//! The leader tracks every event it sent to a member together with the
//! event's size. The sum of unacknowledged bytes never exceeds the window.
//! An acknowledgement for position `P` releases everything sent at or
//! before `P`.

use crate::Position;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct BackpressureHelper {
    /// Maximum unacknowledged bytes
    window: usize,

    /// Bytes sent and not yet acknowledged
    in_flight: usize,

    /// Sent events in position order
    sent: VecDeque<(Position, usize)>,
}

impl BackpressureHelper {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            in_flight: 0,
            sent: VecDeque::new(),
        }
    }

    /// Whether an event of `size` bytes fits into the window right now
    pub fn can_send(&self, size: usize) -> bool {
        self.in_flight + size <= self.window
    }

    /// Account for an event that is about to be sent
    ///
    /// Returns `false` without changing anything if the event does not fit.
    pub fn reserve(&mut self, position: Position, size: usize) -> bool {
        if !self.can_send(size) {
            return false;
        }

        self.in_flight += size;
        self.sent.push_back((position, size));
        true
    }

    /// Release every event sent at or before `position`, returning the freed bytes
    pub fn on_ack(&mut self, position: Position) -> usize {
        let mut released = 0;

        while let Some(&(sent_position, size)) = self.sent.front() {
            if sent_position > position {
                break;
            }
            self.sent.pop_front();
            released += size;
        }

        self.in_flight -= released;
        released
    }

    /// Forget everything in flight
    pub fn reset(&mut self) {
        self.in_flight = 0;
        self.sent.clear();
    }

    pub fn in_flight_bytes(&self) -> usize {
        self.in_flight
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }
}
