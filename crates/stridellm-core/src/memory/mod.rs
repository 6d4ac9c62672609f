//! Paged cache memory
//!
//! [`CacheBlockPool`] owns the block arena, [`CacheManager`] maps sequences
//! to block lists on top of it and handles eviction snapshots and migration.
//! Readers outside the scheduling loop observe capacity through a
//! [`CapacityView`], a copy-on-read snapshot republished after every change.

pub mod block_pool;
pub mod cache_manager;
pub mod migration;
pub mod snapshot;

pub use block_pool::{block_hash, CacheBlock, CacheBlockPool};
pub use cache_manager::{
    select_victims, BlockTable, CacheCheckpoint, CacheManager, CacheStats, EvictionCandidate,
    Footprint,
};
pub use migration::{
    replica_channel, MigrationInbox, MigrationPayload, MigrationTarget, PendingMigration,
    ReplicaLink,
};
pub use snapshot::{CompressedSnapshot, SnapshotCodec, SnapshotStore};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Point-in-time capacity of one cache manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacitySnapshot {
    /// Tick the snapshot was taken at
    pub tick: u64,

    /// Tokens per block
    pub block_size: usize,

    /// Total blocks in the pool
    pub total_blocks: usize,

    /// Blocks on the free list
    pub free_blocks: usize,

    /// Blocks with at least one owner
    pub used_blocks: usize,

    /// Bytes held by eviction snapshots
    pub snapshot_bytes: usize,

    /// Snapshot byte budget
    pub snapshot_capacity_bytes: usize,

    /// Number of held snapshots
    pub num_snapshots: usize,
}

impl CapacitySnapshot {
    /// Free token slots
    pub fn free_tokens(&self) -> usize {
        self.free_blocks * self.block_size
    }

    /// Pool utilization (0.0 - 1.0)
    pub fn utilization(&self) -> f32 {
        if self.total_blocks == 0 {
            return 0.0;
        }
        self.used_blocks as f32 / self.total_blocks as f32
    }
}

/// Read-only handle to the latest published capacity
#[derive(Debug, Clone, Default)]
pub struct CapacityView {
    inner: Arc<RwLock<CapacitySnapshot>>,
}

impl CapacityView {
    /// Latest published snapshot
    pub fn get(&self) -> CapacitySnapshot {
        *self.inner.read()
    }

    pub(crate) fn publish(&self, snapshot: CapacitySnapshot) {
        *self.inner.write() = snapshot;
    }
}
