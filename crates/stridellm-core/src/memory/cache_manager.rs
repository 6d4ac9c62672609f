//! Paged Cache Manager
//!
//! Maps sequences to ordered block lists on top of the [`CacheBlockPool`].
//! All mutation happens from the scheduling loop (single writer); other
//! threads only read the published [`CapacitySnapshot`].
//!
//! Key operations:
//! - `acquire`: all-or-nothing block allocation
//! - `release`: drop a sequence's references, freeing unshared blocks
//! - `evict`: snapshot materialized content, then release
//! - `migrate`: hand a sequence to another worker, atomically

use super::block_pool::{block_hash, CacheBlockPool};
use super::migration::{MigrationPayload, MigrationTarget};
use super::snapshot::{CompressedSnapshot, SnapshotCodec, SnapshotStore};
use super::{CapacitySnapshot, CapacityView};
use crate::config::CacheConfig;
use crate::error::{Error, MigrationError, Result};
use crate::types::{BlockId, Priority, Sequence, SequenceId, TokenId, WorkerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Ordered blocks of one sequence
#[derive(Debug, Clone, Default)]
pub struct BlockTable {
    /// Block IDs in token order
    pub blocks: Vec<BlockId>,

    /// Leading blocks that are full and hashed
    sealed: usize,

    /// Chained hash of the last sealed block
    last_hash: Option<u64>,
}

impl BlockTable {
    /// Number of blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Token capacity of the table
    pub fn capacity(&self, block_size: usize) -> usize {
        self.blocks.len() * block_size
    }
}

/// Block footprint of a sequence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Footprint {
    /// Blocks in the sequence's list
    pub total: usize,

    /// Blocks only this sequence references (freed on release)
    pub exclusive: usize,
}

/// Cumulative cache counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Fresh blocks handed out
    pub blocks_acquired: u64,

    /// Blocks returned to the free list
    pub blocks_freed: u64,

    /// Prompt blocks reused through prefix hashes
    pub prefix_hit_blocks: u64,

    /// Sequences evicted to snapshots
    pub evictions: u64,

    /// Snapshots dropped under memory pressure
    pub snapshots_dropped: u64,

    /// Snapshots restored on resume
    pub snapshot_restores: u64,

    /// Sequences handed to other workers
    pub migrations_out: u64,

    /// Sequences adopted from other workers
    pub migrations_in: u64,
}

/// Copy of the cache state used to roll back an aborted tick
#[derive(Debug, Clone)]
pub struct CacheCheckpoint {
    pool: CacheBlockPool,
    tables: HashMap<SequenceId, BlockTable>,
    snapshots: SnapshotStore,
    stats: CacheStats,
}

/// Candidate for preemption under memory pressure
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    /// Sequence ID
    pub sequence_id: SequenceId,

    /// Scheduling priority
    pub priority: Priority,

    /// Tick the sequence last ran in
    pub last_scheduled_tick: Option<u64>,

    /// Block footprint
    pub footprint: Footprint,
}

/// Choose sequences to evict until `blocks_needed` blocks would be freed.
///
/// Victims come from the lowest priority band first, least recently scheduled
/// first, and then by largest exclusive footprint. Only exclusive blocks count
/// as freed: blocks shared with another sequence stay with it. Returns `None`
/// when even evicting every candidate would not free enough.
pub fn select_victims(
    mut candidates: Vec<EvictionCandidate>,
    blocks_needed: usize,
) -> Option<Vec<SequenceId>> {
    if blocks_needed == 0 {
        return Some(Vec::new());
    }
    candidates.retain(|c| c.footprint.exclusive > 0);
    candidates.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.last_scheduled_tick.cmp(&b.last_scheduled_tick))
            .then(b.footprint.exclusive.cmp(&a.footprint.exclusive))
    });

    let mut freed = 0;
    let mut victims = Vec::new();
    for candidate in candidates {
        freed += candidate.footprint.exclusive;
        victims.push(candidate.sequence_id);
        if freed >= blocks_needed {
            return Some(victims);
        }
    }
    None
}

/// Sequence-to-block mapping over the block pool
#[derive(Debug)]
pub struct CacheManager {
    /// This replica
    worker_id: WorkerId,

    /// Share full prompt blocks across sequences
    enable_prefix_caching: bool,

    /// Block arena
    pool: CacheBlockPool,

    /// Block list per sequence
    tables: HashMap<SequenceId, BlockTable>,

    /// Eviction snapshots
    snapshots: SnapshotStore,

    /// Snapshot encoder
    codec: SnapshotCodec,

    /// Published capacity for concurrent readers
    view: CapacityView,

    /// Counters
    stats: CacheStats,
}

impl CacheManager {
    /// Create a cache manager
    pub fn new(config: &CacheConfig, worker_id: WorkerId) -> Self {
        let manager = Self {
            worker_id,
            enable_prefix_caching: config.enable_prefix_caching,
            pool: CacheBlockPool::new(config.num_blocks, config.block_size),
            tables: HashMap::new(),
            snapshots: SnapshotStore::new(&config.snapshot),
            codec: SnapshotCodec::new(config.snapshot.compression),
            view: CapacityView::default(),
            stats: CacheStats::default(),
        };
        manager.publish(0);
        manager
    }

    /// Tokens per block
    pub fn block_size(&self) -> usize {
        self.pool.block_size()
    }

    /// Total blocks in the pool
    pub fn num_blocks(&self) -> usize {
        self.pool.num_blocks()
    }

    /// Blocks on the free list
    pub fn num_free_blocks(&self) -> usize {
        self.pool.num_free_blocks()
    }

    /// Blocks needed to hold `num_tokens` tokens
    pub fn blocks_for(&self, num_tokens: usize) -> usize {
        self.pool.blocks_for(num_tokens)
    }

    /// Block pool (read-only)
    pub fn pool(&self) -> &CacheBlockPool {
        &self.pool
    }

    /// Block list of a sequence
    pub fn blocks_of(&self, id: SequenceId) -> &[BlockId] {
        self.tables
            .get(&id)
            .map(|t| t.blocks.as_slice())
            .unwrap_or(&[])
    }

    /// Number of blocks a sequence holds
    pub fn num_blocks_of(&self, id: SequenceId) -> usize {
        self.tables.get(&id).map_or(0, BlockTable::len)
    }

    /// Total and exclusive block counts of a sequence
    pub fn footprint(&self, id: SequenceId) -> Footprint {
        let blocks = self.blocks_of(id);
        Footprint {
            total: blocks.len(),
            exclusive: blocks
                .iter()
                .filter(|b| self.pool.ref_count(**b) == 1)
                .count(),
        }
    }

    /// Append `count` fresh blocks to a sequence, all or nothing
    pub fn acquire(&mut self, id: SequenceId, count: usize) -> Result<Vec<BlockId>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let blocks = self.pool.allocate(id, count)?;
        self.tables
            .entry(id)
            .or_default()
            .blocks
            .extend_from_slice(&blocks);
        self.stats.blocks_acquired += count as u64;
        Ok(blocks)
    }

    /// Leading full blocks of `tokens` already present in the pool
    fn prefix_match(&self, tokens: &[TokenId]) -> Vec<(BlockId, u64)> {
        if !self.enable_prefix_caching {
            return Vec::new();
        }
        let mut parent = None;
        let mut matched = Vec::new();
        for chunk in tokens.chunks_exact(self.block_size()) {
            let hash = block_hash(parent, chunk);
            match self.pool.lookup(hash) {
                Some(block) => {
                    matched.push((block, hash));
                    parent = Some(hash);
                }
                None => break,
            }
        }
        matched
    }

    /// Fresh blocks a new sequence would take from the free list when its
    /// shareable prefix is `tokens` and it needs `total_blocks` in all
    pub fn prompt_cost(&self, tokens: &[TokenId], total_blocks: usize) -> usize {
        total_blocks - self.prefix_match(tokens).len().min(total_blocks)
    }

    /// Give a sequence without blocks `total_blocks` blocks, reusing cached
    /// prefix blocks of `tokens` where possible. All or nothing.
    ///
    /// Returns the number of prompt tokens covered by shared blocks.
    pub fn acquire_for_prompt(
        &mut self,
        id: SequenceId,
        tokens: &[TokenId],
        total_blocks: usize,
    ) -> Result<usize> {
        if self.num_blocks_of(id) > 0 {
            return Err(Error::invariant(format!(
                "prompt acquisition for sequence {id} which already holds blocks"
            )));
        }
        let mut matched = self.prefix_match(tokens);
        matched.truncate(total_blocks);
        let fresh = total_blocks - matched.len();
        if fresh > self.pool.num_free_blocks() {
            return Err(Error::OutOfCapacity {
                requested: fresh,
                available: self.pool.num_free_blocks(),
            });
        }

        for (block, _) in &matched {
            self.pool.share(*block)?;
        }
        let new_blocks = self.pool.allocate(id, fresh)?;
        let table = self.tables.entry(id).or_default();
        table.blocks = matched.iter().map(|(b, _)| *b).collect();
        table.blocks.extend_from_slice(&new_blocks);
        table.sealed = matched.len();
        table.last_hash = matched.last().map(|(_, h)| *h);

        self.stats.blocks_acquired += fresh as u64;
        self.stats.prefix_hit_blocks += matched.len() as u64;
        if !matched.is_empty() {
            tracing::debug!(
                "Sequence {} reuses {} cached prefix blocks",
                id,
                matched.len()
            );
        }
        Ok(matched.len() * self.block_size())
    }

    /// Register content hashes for blocks that became full
    pub fn seal_computed(&mut self, id: SequenceId, tokens: &[TokenId], num_computed: usize) -> Result<()> {
        let block_size = self.block_size();
        let Some(table) = self.tables.get_mut(&id) else {
            return Ok(());
        };
        let full = (num_computed.min(tokens.len()) / block_size).min(table.blocks.len());
        if self.enable_prefix_caching {
            while table.sealed < full {
                let i = table.sealed;
                let hash = block_hash(table.last_hash, &tokens[i * block_size..(i + 1) * block_size]);
                self.pool.seal(table.blocks[i], hash)?;
                table.sealed += 1;
                table.last_hash = Some(hash);
            }
        }
        for block in &table.blocks[full..] {
            self.pool.mark_dirty(*block);
        }
        Ok(())
    }

    /// Drop blocks past the first `keep` of a sequence; returns blocks freed
    pub fn trim(&mut self, id: SequenceId, keep: usize) -> Result<usize> {
        let Some(table) = self.tables.get_mut(&id) else {
            return Ok(0);
        };
        let mut freed = 0;
        while table.blocks.len() > keep {
            if let Some(block) = table.blocks.pop() {
                if self.pool.free(block)? {
                    freed += 1;
                }
            }
        }
        if table.sealed > table.blocks.len() {
            table.sealed = table.blocks.len();
            table.last_hash = table
                .blocks
                .last()
                .and_then(|b| self.pool.get(*b))
                .and_then(|b| b.hash);
        }
        self.stats.blocks_freed += freed as u64;
        Ok(freed)
    }

    /// Release every block of a sequence; returns blocks freed
    pub fn release(&mut self, id: SequenceId) -> Result<usize> {
        let Some(table) = self.tables.remove(&id) else {
            return Ok(0);
        };
        let mut freed = 0;
        for block in table.blocks {
            if self.pool.free(block)? {
                freed += 1;
            }
        }
        self.stats.blocks_freed += freed as u64;
        Ok(freed)
    }

    /// Snapshot the materialized tokens of a preempted sequence and release
    /// its blocks. Older snapshots may be dropped to stay within budget.
    pub fn evict(&mut self, id: SequenceId, materialized: &[TokenId]) -> Result<Arc<CompressedSnapshot>> {
        let snapshot = Arc::new(self.codec.encode(id, materialized)?);
        let dropped = self.snapshots.insert(snapshot.clone());
        for victim in &dropped {
            tracing::warn!("Dropped eviction snapshot of sequence {}", victim);
        }
        self.stats.snapshots_dropped += dropped.len() as u64;
        let freed = self.release(id)?;
        self.stats.evictions += 1;
        tracing::debug!(
            "Evicted sequence {}: {} tokens, {} -> {} bytes, {} blocks freed",
            id,
            snapshot.num_tokens,
            snapshot.raw_bytes(),
            snapshot.stored_bytes(),
            freed
        );
        Ok(snapshot)
    }

    /// Remove and decode the snapshot of a sequence, if one is still held
    pub fn take_snapshot(&mut self, id: SequenceId) -> Result<Option<Vec<TokenId>>> {
        let Some(snapshot) = self.snapshots.remove(id) else {
            return Ok(None);
        };
        let tokens = SnapshotCodec::decode(&snapshot)?;
        self.stats.snapshot_restores += 1;
        Ok(Some(tokens))
    }

    /// Store a snapshot received from another worker
    pub fn adopt_snapshot(&mut self, snapshot: CompressedSnapshot) {
        let dropped = self.snapshots.insert(Arc::new(snapshot));
        self.stats.snapshots_dropped += dropped.len() as u64;
        self.stats.migrations_in += 1;
    }

    /// Whether a snapshot is held for a sequence
    pub fn has_snapshot(&self, id: SequenceId) -> bool {
        self.snapshots.contains(id)
    }

    /// Token count of a held snapshot
    pub fn snapshot_tokens(&self, id: SequenceId) -> Option<usize> {
        self.snapshots.get(id).map(|s| s.num_tokens)
    }

    /// Forget a sequence's snapshot
    pub fn discard_snapshot(&mut self, id: SequenceId) {
        self.snapshots.remove(id);
    }

    /// Hand a sequence to another worker.
    ///
    /// On success the sequence's blocks and snapshot are gone from this
    /// worker. On failure nothing changed and the sequence stays usable here.
    pub fn migrate(
        &mut self,
        sequence: &Sequence,
        target: &dyn MigrationTarget,
    ) -> Result<()> {
        let id = sequence.id;
        if target.worker_id() == self.worker_id {
            return Err(MigrationError::SameWorker(self.worker_id).into());
        }
        let snapshot = match self.snapshots.get(id) {
            Some(held) => CompressedSnapshot::clone(held),
            None => {
                let context = sequence.context();
                let materialized = &context[..sequence.num_computed.min(context.len())];
                self.codec
                    .encode(id, materialized)
                    .map_err(|_| MigrationError::NotMigratable(id))?
            }
        };
        target.send(MigrationPayload::capture(self.worker_id, sequence, snapshot))?;

        self.release(id)?;
        self.snapshots.remove(id);
        self.stats.migrations_out += 1;
        tracing::info!("Migrated sequence {} to {}", id, target.worker_id());
        Ok(())
    }

    /// Check that every reference count equals the number of block lists
    /// that include the block
    pub fn verify(&self) -> Result<()> {
        let mut expected: HashMap<BlockId, usize> = HashMap::new();
        for table in self.tables.values() {
            for block in &table.blocks {
                *expected.entry(*block).or_default() += 1;
            }
        }
        self.pool.verify(&expected)
    }

    /// Current capacity
    pub fn capacity(&self, tick: u64) -> CapacitySnapshot {
        CapacitySnapshot {
            tick,
            block_size: self.pool.block_size(),
            total_blocks: self.pool.num_blocks(),
            free_blocks: self.pool.num_free_blocks(),
            used_blocks: self.pool.num_used_blocks(),
            snapshot_bytes: self.snapshots.used_bytes(),
            snapshot_capacity_bytes: self.snapshots.capacity_bytes(),
            num_snapshots: self.snapshots.len(),
        }
    }

    /// Publish the current capacity to readers
    pub fn publish(&self, tick: u64) {
        self.view.publish(self.capacity(tick));
    }

    /// Handle for concurrent capacity readers
    pub fn view(&self) -> CapacityView {
        self.view.clone()
    }

    /// Counters
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Copy the mutable state
    pub fn checkpoint(&self) -> CacheCheckpoint {
        CacheCheckpoint {
            pool: self.pool.clone(),
            tables: self.tables.clone(),
            snapshots: self.snapshots.clone(),
            stats: self.stats.clone(),
        }
    }

    /// Restore state captured by [`CacheManager::checkpoint`]
    pub fn rollback(&mut self, checkpoint: CacheCheckpoint) {
        self.pool = checkpoint.pool;
        self.tables = checkpoint.tables;
        self.snapshots = checkpoint.snapshots;
        self.stats = checkpoint.stats;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Compression, SnapshotConfig};
    use crate::memory::migration::replica_channel;
    use crate::types::SubmitRequest;
    use std::time::Instant;

    fn manager(num_blocks: usize, block_size: usize) -> CacheManager {
        let config = CacheConfig {
            block_size,
            num_blocks,
            enable_prefix_caching: true,
            snapshot: SnapshotConfig {
                capacity_bytes: 1024,
                compression: Compression::Zstd { level: 1 },
            },
        };
        CacheManager::new(&config, WorkerId(0))
    }

    #[test]
    fn test_acquire_release() {
        let mut cache = manager(8, 4);
        let seq = SequenceId::new();

        let blocks = cache.acquire(seq, 3).unwrap();
        assert_eq!(cache.blocks_of(seq), blocks.as_slice());
        assert_eq!(cache.num_free_blocks(), 5);

        let err = cache.acquire(seq, 6).unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(cache.num_blocks_of(seq), 3);

        assert_eq!(cache.release(seq).unwrap(), 3);
        assert_eq!(cache.num_free_blocks(), 8);
        assert!(cache.verify().is_ok());
    }

    #[test]
    fn test_prefix_sharing() {
        let mut cache = manager(8, 2);
        let a = SequenceId::new();
        let b = SequenceId::new();
        let prompt = [1, 2, 3, 4, 5];

        assert_eq!(cache.acquire_for_prompt(a, &prompt[..4], 3).unwrap(), 0);
        cache.seal_computed(a, &prompt, 4).unwrap();

        assert_eq!(cache.prompt_cost(&prompt[..4], 3), 1);
        assert_eq!(cache.acquire_for_prompt(b, &prompt[..4], 3).unwrap(), 4);
        assert_eq!(cache.num_free_blocks(), 4);
        assert_eq!(cache.blocks_of(a)[..2], cache.blocks_of(b)[..2]);
        assert_eq!(cache.footprint(b), Footprint { total: 3, exclusive: 1 });

        // Shared blocks stay with the remaining owner.
        assert_eq!(cache.release(a).unwrap(), 1);
        assert_eq!(cache.pool().ref_count(cache.blocks_of(b)[0]), 1);
        assert!(cache.verify().is_ok());
    }

    #[test]
    fn test_unsealed_blocks_are_not_shared() {
        let mut cache = manager(8, 2);
        let a = SequenceId::new();
        cache.acquire_for_prompt(a, &[1, 2], 2).unwrap();
        assert_eq!(cache.prompt_cost(&[1, 2], 2), 2);
    }

    #[test]
    fn test_trim() {
        let mut cache = manager(8, 4);
        let seq = SequenceId::new();
        cache.acquire(seq, 5).unwrap();
        assert_eq!(cache.trim(seq, 2).unwrap(), 3);
        assert_eq!(cache.num_blocks_of(seq), 2);
        assert_eq!(cache.num_free_blocks(), 6);
    }

    #[test]
    fn test_evict_and_restore() {
        let mut cache = manager(8, 4);
        let seq = SequenceId::new();
        cache.acquire(seq, 2).unwrap();

        let content: Vec<TokenId> = (0..7).collect();
        let snapshot = cache.evict(seq, &content).unwrap();
        assert_eq!(snapshot.num_tokens, 7);
        assert_eq!(cache.num_free_blocks(), 8);
        assert!(cache.has_snapshot(seq));

        assert_eq!(cache.take_snapshot(seq).unwrap(), Some(content));
        assert!(!cache.has_snapshot(seq));
        assert_eq!(cache.take_snapshot(seq).unwrap(), None);
    }

    #[test]
    fn test_checkpoint_rollback() {
        let mut cache = manager(8, 4);
        let seq = SequenceId::new();
        cache.acquire(seq, 2).unwrap();
        let checkpoint = cache.checkpoint();

        cache.acquire(seq, 3).unwrap();
        cache.release(seq).unwrap();
        cache.rollback(checkpoint);

        assert_eq!(cache.num_blocks_of(seq), 2);
        assert_eq!(cache.num_free_blocks(), 6);
        assert!(cache.verify().is_ok());
    }

    #[test]
    fn test_select_victims_order() {
        let candidate = |priority, tick, exclusive| EvictionCandidate {
            sequence_id: SequenceId::new(),
            priority,
            last_scheduled_tick: Some(tick),
            footprint: Footprint {
                total: exclusive,
                exclusive,
            },
        };
        let normal = candidate(Priority::Normal, 1, 4);
        let low_recent = candidate(Priority::Low, 9, 2);
        let low_stale = candidate(Priority::Low, 3, 1);
        let low_stale_big = candidate(Priority::Low, 3, 5);
        let candidates = vec![
            normal.clone(),
            low_recent.clone(),
            low_stale.clone(),
            low_stale_big.clone(),
        ];

        let victims = select_victims(candidates.clone(), 6).unwrap();
        assert_eq!(
            victims,
            vec![low_stale_big.sequence_id, low_stale.sequence_id]
        );

        let victims = select_victims(candidates.clone(), 9).unwrap();
        assert_eq!(victims.len(), 4);
        assert_eq!(victims[3], normal.sequence_id);

        assert!(select_victims(candidates, 13).is_none());
    }

    #[test]
    fn test_shared_only_candidates_are_skipped() {
        let shared = EvictionCandidate {
            sequence_id: SequenceId::new(),
            priority: Priority::Idle,
            last_scheduled_tick: None,
            footprint: Footprint {
                total: 4,
                exclusive: 0,
            },
        };
        assert!(select_victims(vec![shared], 1).is_none());
    }

    #[test]
    fn test_migrate() {
        let mut cache = manager(8, 4);
        let mut sequence = Sequence::from_request(
            SequenceId::new(),
            SubmitRequest::new(vec![1, 2, 3, 4, 5]),
            None,
            Instant::now(),
        );
        sequence.num_computed = 4;
        cache.acquire(sequence.id, 2).unwrap();

        let (link, mut inbox) = replica_channel(WorkerId(0), 1);
        assert!(matches!(
            cache.migrate(&sequence, &link),
            Err(Error::Migration(MigrationError::SameWorker(_)))
        ));

        let (link, mut inbox_1) = replica_channel(WorkerId(1), 1);
        cache.migrate(&sequence, &link).unwrap();
        assert_eq!(cache.num_free_blocks(), 8);
        let payloads = inbox_1.drain();
        assert_eq!(payloads.len(), 1);
        assert_eq!(
            SnapshotCodec::decode(&payloads[0].snapshot).unwrap(),
            vec![1, 2, 3, 4]
        );
        assert!(inbox.drain().is_empty());
    }

    #[test]
    fn test_failed_migration_changes_nothing() {
        let mut cache = manager(8, 4);
        let sequence = Sequence::from_request(
            SequenceId::new(),
            SubmitRequest::new(vec![1, 2, 3]),
            None,
            Instant::now(),
        );
        cache.acquire(sequence.id, 1).unwrap();

        let (link, inbox) = replica_channel(WorkerId(4), 1);
        drop(inbox);
        let err = cache.migrate(&sequence, &link).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(cache.num_blocks_of(sequence.id), 1);
    }
}
