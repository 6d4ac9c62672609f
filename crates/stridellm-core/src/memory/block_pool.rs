//! Cache block pool
//!
//! Fixed-size blocks live in an arena indexed by [`BlockId`] with explicit
//! reference counts. A block whose count drops to zero goes back to the free
//! list immediately. Full, clean blocks can be registered under a chained
//! content hash so later prompts with the same prefix share them.

use crate::error::{Error, Result};
use crate::types::{BlockId, SequenceId, TokenId};
use std::collections::{HashMap, VecDeque};
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Hash of a full block, chained with the hash of the block before it
pub fn block_hash(parent: Option<u64>, tokens: &[TokenId]) -> u64 {
    let bytes: Vec<u8> = tokens.iter().flat_map(|t| t.to_le_bytes()).collect();
    xxh3_64_with_seed(&bytes, parent.unwrap_or(0))
}

/// One cache block
#[derive(Debug, Clone)]
pub struct CacheBlock {
    /// Block ID
    pub id: BlockId,

    /// Sequence that allocated the block (`None` = free)
    pub owner: Option<SequenceId>,

    /// Number of block lists that include this block
    pub ref_count: usize,

    /// Content hash once the block is full
    pub hash: Option<u64>,

    /// Contents are still being written and cannot be shared
    pub dirty: bool,
}

impl CacheBlock {
    fn new(id: BlockId) -> Self {
        Self {
            id,
            owner: None,
            ref_count: 0,
            hash: None,
            dirty: false,
        }
    }

    /// Whether the block is on the free list
    pub fn is_free(&self) -> bool {
        self.ref_count == 0
    }
}

/// Arena of cache blocks with a free list
#[derive(Debug, Clone)]
pub struct CacheBlockPool {
    /// Tokens per block
    block_size: usize,

    /// Block arena
    blocks: Vec<CacheBlock>,

    /// Free block queue
    free_blocks: VecDeque<BlockId>,

    /// Content hash -> block holding that content
    hash_index: HashMap<u64, BlockId>,
}

impl CacheBlockPool {
    /// Create a pool of `num_blocks` free blocks
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        Self {
            block_size,
            blocks: (0..num_blocks).map(CacheBlock::new).collect(),
            free_blocks: (0..num_blocks).collect(),
            hash_index: HashMap::new(),
        }
    }

    /// Tokens per block
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total number of blocks
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Number of free blocks
    pub fn num_free_blocks(&self) -> usize {
        self.free_blocks.len()
    }

    /// Number of blocks with a non-zero reference count
    pub fn num_used_blocks(&self) -> usize {
        self.blocks.len() - self.free_blocks.len()
    }

    /// Blocks needed to hold `num_tokens` tokens
    pub fn blocks_for(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.block_size)
    }

    /// Block information
    pub fn get(&self, id: BlockId) -> Option<&CacheBlock> {
        self.blocks.get(id)
    }

    /// Reference count of a block (0 for unknown IDs)
    pub fn ref_count(&self, id: BlockId) -> usize {
        self.blocks.get(id).map_or(0, |b| b.ref_count)
    }

    /// Allocate `count` fresh blocks for `owner`, all or nothing
    pub fn allocate(&mut self, owner: SequenceId, count: usize) -> Result<Vec<BlockId>> {
        if self.free_blocks.len() < count {
            return Err(Error::OutOfCapacity {
                requested: count,
                available: self.free_blocks.len(),
            });
        }
        let mut allocated = Vec::with_capacity(count);
        for _ in 0..count {
            let id = self
                .free_blocks
                .pop_front()
                .ok_or_else(|| Error::invariant("free list shorter than its length"))?;
            let block = &mut self.blocks[id];
            if block.ref_count != 0 {
                return Err(Error::invariant(format!(
                    "block {id} on free list with ref count {}",
                    block.ref_count
                )));
            }
            block.owner = Some(owner);
            block.ref_count = 1;
            block.dirty = true;
            allocated.push(id);
        }
        Ok(allocated)
    }

    /// Add a reference to an allocated block
    pub fn share(&mut self, id: BlockId) -> Result<()> {
        let block = self
            .blocks
            .get_mut(id)
            .ok_or_else(|| Error::invariant(format!("share of unknown block {id}")))?;
        if block.ref_count == 0 {
            return Err(Error::invariant(format!("share of free block {id}")));
        }
        block.ref_count += 1;
        Ok(())
    }

    /// Drop a reference; returns true if the block went back to the free list
    pub fn free(&mut self, id: BlockId) -> Result<bool> {
        let block = self
            .blocks
            .get_mut(id)
            .ok_or_else(|| Error::invariant(format!("free of unknown block {id}")))?;
        if block.ref_count == 0 {
            return Err(Error::invariant(format!("double free of block {id}")));
        }
        block.ref_count -= 1;
        if block.ref_count > 0 {
            return Ok(false);
        }
        if let Some(hash) = block.hash.take() {
            if self.hash_index.get(&hash) == Some(&id) {
                self.hash_index.remove(&hash);
            }
        }
        block.owner = None;
        block.dirty = false;
        self.free_blocks.push_back(id);
        Ok(true)
    }

    /// Mark a full block clean and register its content hash
    pub fn seal(&mut self, id: BlockId, hash: u64) -> Result<()> {
        let block = self
            .blocks
            .get_mut(id)
            .ok_or_else(|| Error::invariant(format!("seal of unknown block {id}")))?;
        if block.ref_count == 0 {
            return Err(Error::invariant(format!("seal of free block {id}")));
        }
        block.hash = Some(hash);
        block.dirty = false;
        self.hash_index.entry(hash).or_insert(id);
        Ok(())
    }

    /// Mark a block as being written
    pub fn mark_dirty(&mut self, id: BlockId) {
        if let Some(block) = self.blocks.get_mut(id) {
            if block.ref_count > 0 && block.hash.is_none() {
                block.dirty = true;
            }
        }
    }

    /// Live, clean block holding the given content hash
    pub fn lookup(&self, hash: u64) -> Option<BlockId> {
        let id = *self.hash_index.get(&hash)?;
        let block = &self.blocks[id];
        (block.ref_count > 0 && !block.dirty && block.hash == Some(hash)).then_some(id)
    }

    /// Check internal consistency against the expected reference counts
    pub fn verify(&self, expected: &HashMap<BlockId, usize>) -> Result<()> {
        for block in &self.blocks {
            let want = expected.get(&block.id).copied().unwrap_or(0);
            if block.ref_count != want {
                return Err(Error::invariant(format!(
                    "block {} has ref count {} but {} owners",
                    block.id, block.ref_count, want
                )));
            }
        }
        let free = self.blocks.iter().filter(|b| b.is_free()).count();
        if free != self.free_blocks.len() {
            return Err(Error::invariant(format!(
                "{} blocks free but free list holds {}",
                free,
                self.free_blocks.len()
            )));
        }
        Ok(())
    }

    /// Pool utilization (0.0 - 1.0)
    pub fn utilization(&self) -> f32 {
        if self.blocks.is_empty() {
            return 0.0;
        }
        self.num_used_blocks() as f32 / self.blocks.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free() {
        let mut pool = CacheBlockPool::new(10, 16);
        let owner = SequenceId::new();

        let blocks = pool.allocate(owner, 3).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(pool.num_free_blocks(), 7);
        assert_eq!(pool.get(blocks[0]).unwrap().owner, Some(owner));
        assert!(pool.get(blocks[0]).unwrap().dirty);

        assert!(pool.free(blocks[0]).unwrap());
        assert_eq!(pool.num_free_blocks(), 8);
        assert!(pool.get(blocks[0]).unwrap().owner.is_none());
    }

    #[test]
    fn test_allocate_is_all_or_nothing() {
        let mut pool = CacheBlockPool::new(4, 16);
        let owner = SequenceId::new();
        pool.allocate(owner, 3).unwrap();

        let err = pool.allocate(owner, 2).unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfCapacity {
                requested: 2,
                available: 1
            }
        ));
        assert_eq!(pool.num_free_blocks(), 1);
    }

    #[test]
    fn test_ref_counting() {
        let mut pool = CacheBlockPool::new(4, 16);
        let block = pool.allocate(SequenceId::new(), 1).unwrap()[0];
        pool.share(block).unwrap();
        assert_eq!(pool.ref_count(block), 2);

        assert!(!pool.free(block).unwrap());
        assert_eq!(pool.num_free_blocks(), 3);
        assert!(pool.free(block).unwrap());
        assert_eq!(pool.num_free_blocks(), 4);

        assert!(matches!(pool.free(block), Err(Error::InvariantViolation(_))));
        assert!(pool.share(block).is_err());
    }

    #[test]
    fn test_sealed_blocks_are_shareable() {
        let mut pool = CacheBlockPool::new(4, 4);
        let block = pool.allocate(SequenceId::new(), 1).unwrap()[0];
        let hash = block_hash(None, &[1, 2, 3, 4]);

        assert_eq!(pool.lookup(hash), None);
        pool.seal(block, hash).unwrap();
        assert_eq!(pool.lookup(hash), Some(block));

        pool.free(block).unwrap();
        assert_eq!(pool.lookup(hash), None);
    }

    #[test]
    fn test_chained_hash_depends_on_parent() {
        let first = block_hash(None, &[1, 2]);
        let second = block_hash(Some(first), &[3, 4]);
        assert_ne!(second, block_hash(None, &[3, 4]));
        assert_eq!(second, block_hash(Some(first), &[3, 4]));
    }

    #[test]
    fn test_verify() {
        let mut pool = CacheBlockPool::new(4, 16);
        let blocks = pool.allocate(SequenceId::new(), 2).unwrap();
        let mut expected: HashMap<BlockId, usize> = blocks.iter().map(|b| (*b, 1)).collect();
        assert!(pool.verify(&expected).is_ok());

        expected.insert(blocks[0], 2);
        assert!(pool.verify(&expected).is_err());
    }
}
