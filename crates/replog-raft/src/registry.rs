//! Raft instances of one node, keyed by partition

use crate::{actor::RaftHandle, PartitionId, RaftResult};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Holds one [`RaftHandle`] per partition
#[derive(Clone, Default)]
pub struct PartitionRegistry {
    partitions: Arc<DashMap<PartitionId, RaftHandle>>,
}

impl PartitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `raft`, returning the handle it replaced
    pub fn insert(&self, raft: RaftHandle) -> Option<RaftHandle> {
        let partition_id = raft.partition_id();
        let previous = self.partitions.insert(partition_id, raft);
        if previous.is_some() {
            warn!("Replaced raft of partition {}", partition_id);
        }
        previous
    }

    pub fn get(&self, partition_id: PartitionId) -> Option<RaftHandle> {
        self.partitions
            .get(&partition_id)
            .map(|entry| entry.value().clone())
    }

    /// Remove the raft of `partition_id` and close it
    pub async fn remove(&self, partition_id: PartitionId) -> RaftResult<bool> {
        let Some((_, raft)) = self.partitions.remove(&partition_id) else {
            return Ok(false);
        };

        raft.close().await?;
        info!("Removed raft of partition {}", partition_id);
        Ok(true)
    }

    /// Registered partitions in ascending order
    pub fn partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<PartitionId> =
            self.partitions.iter().map(|entry| *entry.key()).collect();
        partitions.sort_unstable();
        partitions
    }

    /// Remove and close every raft
    pub async fn close_all(&self) -> RaftResult<()> {
        for partition_id in self.partitions() {
            self.remove(partition_id).await?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}
