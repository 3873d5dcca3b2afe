//! Leader contact tracking and randomized election timeout
//!
//! A follower records every contact with its leader (and every vote it
//! grants). Once no contact happened within the current randomized timeout,
//! the follower should start an election. The timeout is re-drawn on every
//! contact so that members of a cluster time out at different moments.

use crate::config::RaftConfig;
use rand::Rng;
use std::ops::RangeInclusive;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct Heartbeat {
    last_contact: Instant,

    /// Drawn from `timeout_range_ms` on every contact
    election_timeout: Duration,

    timeout_range_ms: RangeInclusive<u64>,
}

impl Heartbeat {
    pub fn new(min_timeout_ms: u64, max_timeout_ms: u64) -> Self {
        let timeout_range_ms = min_timeout_ms..=max_timeout_ms;
        Self {
            last_contact: Instant::now(),
            election_timeout: draw_timeout(&timeout_range_ms),
            timeout_range_ms,
        }
    }

    pub fn from_config(config: &RaftConfig) -> Self {
        Self::new(config.election_timeout_min_ms, config.election_timeout_max_ms)
    }

    /// Record contact with the leader or a granted vote
    pub fn update_last_contact(&mut self) {
        self.last_contact = Instant::now();
        self.election_timeout = draw_timeout(&self.timeout_range_ms);
    }

    /// No contact happened within the election timeout
    pub fn should_elect(&self) -> bool {
        self.last_contact.elapsed() >= self.election_timeout
    }

    /// Time until `should_elect` turns true, zero once it has
    pub fn time_remaining(&self) -> Duration {
        self.election_timeout
            .saturating_sub(self.last_contact.elapsed())
    }

    pub fn timeout(&self) -> Duration {
        self.election_timeout
    }
}

fn draw_timeout(range_ms: &RangeInclusive<u64>) -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(range_ms.clone()))
}
