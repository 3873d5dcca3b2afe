//! Raft tuning and node identity configuration

use crate::{NodeAddr, PartitionId, RaftError, RaftResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and flow-control parameters shared by all controllers of a Raft
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Minimum election timeout (milliseconds)
    pub election_timeout_min_ms: u64,

    /// Maximum election timeout (milliseconds)
    pub election_timeout_max_ms: u64,

    /// Heartbeat interval of a leader (milliseconds)
    pub heartbeat_interval_ms: u64,

    /// Timeout of poll and vote requests (milliseconds)
    pub request_timeout_ms: u64,

    /// Timeout of join and leave requests (milliseconds)
    ///
    /// A leader answers these only after the membership event committed.
    pub configuration_request_timeout_ms: u64,

    /// Backoff before retrying a failed send or append (milliseconds)
    pub retry_backoff_ms: u64,

    /// Time a membership event may stay uncommitted before it is appended again (milliseconds)
    pub membership_commit_timeout_ms: u64,

    /// Receive buffer size of a remote member (bytes)
    pub receive_buffer_size: usize,

    /// Largest event the log stream accepts (bytes)
    pub max_event_size: usize,
}

impl RaftConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            request_timeout_ms: 500,
            configuration_request_timeout_ms: 5_000,
            retry_backoff_ms: 200,
            membership_commit_timeout_ms: 15 * 60 * 1_000,
            receive_buffer_size: 4 * 1024 * 1024,
            max_event_size: 1024 * 1024,
        }
    }

    /// Parse a JSON document; absent fields keep their defaults
    pub fn from_json(json: &str) -> RaftResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| RaftError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> RaftResult<()> {
        if self.election_timeout_min_ms == 0 {
            return Err(RaftError::ConfigError(
                "election_timeout_min_ms must be positive".to_string(),
            ));
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err(RaftError::ConfigError(format!(
                "election timeout range {}..{} is empty",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(RaftError::ConfigError(format!(
                "heartbeat interval {}ms must be positive and below the election timeout {}ms",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        if self.max_event_size > self.backpressure_window() {
            return Err(RaftError::ConfigError(format!(
                "max event size {} exceeds the backpressure window {}",
                self.max_event_size,
                self.backpressure_window()
            )));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn configuration_request_timeout(&self) -> Duration {
        Duration::from_millis(self.configuration_request_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn membership_commit_timeout(&self) -> Duration {
        Duration::from_millis(self.membership_commit_timeout_ms)
    }

    /// Unacknowledged bytes allowed in flight to one member: half its receive buffer
    pub fn backpressure_window(&self) -> usize {
        self.receive_buffer_size / 2
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of one Raft instance plus its tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftNodeConfig {
    /// Partition this Raft replicates
    pub partition_id: PartitionId,

    /// Address this node is reachable at
    pub local_address: NodeAddr,

    /// Other members known at start
    pub members: Vec<NodeAddr>,

    /// Whether `members` is the agreed configuration
    ///
    /// A bootstrapped node takes part in elections right away. Otherwise it
    /// waits until [`crate::RaftHandle::join`] completed.
    pub bootstrap: bool,

    /// Tuning
    pub raft: RaftConfig,
}

impl RaftNodeConfig {
    /// Configuration of a node that is part of the initial cluster
    pub fn new(partition_id: PartitionId, local_address: NodeAddr, members: Vec<NodeAddr>) -> Self {
        Self {
            partition_id,
            local_address,
            members,
            bootstrap: true,
            raft: RaftConfig::default(),
        }
    }

    /// Configuration of a node that joins a running cluster through `members`
    pub fn joining(
        partition_id: PartitionId,
        local_address: NodeAddr,
        members: Vec<NodeAddr>,
    ) -> Self {
        Self {
            bootstrap: false,
            ..Self::new(partition_id, local_address, members)
        }
    }

    pub fn with_raft_config(mut self, raft: RaftConfig) -> Self {
        self.raft = raft;
        self
    }
}
