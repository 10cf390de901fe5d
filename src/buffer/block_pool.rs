use std::collections::HashMap;

use crate::common::BlockId;

use super::{BlockAccessIndex, LruReplacer};

/// Lookup of resident blocks by number, as needed by commit and rollback.
pub trait ResidentBlocks {
    fn resident_mut(&mut self, block: BlockId) -> Option<&mut BlockAccessIndex>;
}

/// BlockPool holds the resident blocks of a session keyed by block number.
/// It owns every entry; loading, flushing and eviction I/O is driven by the
/// session, which also owns the undo log that must see a dirty block before
/// it is written home.
#[derive(Debug)]
pub struct BlockPool {
    /// Maximum number of resident blocks
    pool_size: usize,
    /// Block table: maps block numbers to resident entries
    blocks: HashMap<BlockId, BlockAccessIndex>,
    /// LRU replacer for eviction decisions
    replacer: LruReplacer,
}

impl BlockPool {
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size: pool_size.max(1),
            blocks: HashMap::with_capacity(pool_size),
            replacer: LruReplacer::new(),
        }
    }

    pub fn get(&self, block: BlockId) -> Option<&BlockAccessIndex> {
        self.blocks.get(&block)
    }

    pub fn get_mut(&mut self, block: BlockId) -> Option<&mut BlockAccessIndex> {
        self.blocks.get_mut(&block)
    }

    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.contains_key(&block)
    }

    /// Adds an entry, replacing any previous entry for the same block. The
    /// entry starts unpinned and evictable; callers make room first.
    pub fn insert(&mut self, entry: BlockAccessIndex) {
        let block = entry.block_id();
        let evictable = entry.pin_count() == 0;
        self.blocks.insert(block, entry);
        self.replacer.record_access(block);
        self.replacer.set_evictable(block, evictable);
    }

    /// Removes an entry regardless of its state.
    pub fn remove(&mut self, block: BlockId) -> Option<BlockAccessIndex> {
        self.replacer.remove(block);
        self.blocks.remove(&block)
    }

    /// Pins a resident block and records the access. Returns the new pin count.
    pub fn pin(&mut self, block: BlockId) -> Option<u32> {
        let entry = self.blocks.get_mut(&block)?;
        let count = entry.pin();
        self.replacer.record_access(block);
        self.replacer.set_evictable(block, false);
        Some(count)
    }

    /// Unpins a resident block; it becomes evictable when no pins remain.
    pub fn unpin(&mut self, block: BlockId) -> Option<u32> {
        let count = self.blocks.get_mut(&block)?.unpin()?;
        if count == 0 {
            self.replacer.set_evictable(block, true);
        }
        Some(count)
    }

    /// Picks an unpinned block to evict. The entry stays in the pool until
    /// the caller has flushed it and calls [`BlockPool::remove`].
    pub fn victim(&mut self) -> Option<BlockId> {
        self.replacer.evict()
    }

    /// Makes a block returned by [`BlockPool::victim`] a candidate again
    /// when it could not be evicted after all.
    pub fn requeue(&mut self, block: BlockId) {
        if let Some(entry) = self.blocks.get(&block) {
            let evictable = entry.pin_count() == 0;
            self.replacer.record_access(block);
            self.replacer.set_evictable(block, evictable);
        }
    }

    /// Number of resident blocks that may be evicted.
    pub fn evictable_count(&self) -> usize {
        self.replacer.size()
    }

    pub fn is_full(&self) -> bool {
        self.blocks.len() >= self.pool_size
    }

    /// Block numbers of all dirty resident blocks, in ascending order.
    pub fn dirty_blocks(&self) -> Vec<BlockId> {
        let mut dirty: Vec<_> = self
            .blocks
            .values()
            .filter(|e| e.is_dirty())
            .map(|e| e.block_id())
            .collect();
        dirty.sort();
        dirty
    }

    /// Drops every dirty resident block without writing it. Returns how many
    /// were dropped.
    pub fn discard_dirty(&mut self) -> usize {
        let dirty = self.dirty_blocks();
        for &block in &dirty {
            self.remove(block);
        }
        dirty.len()
    }

    /// Iterates over resident entries mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BlockAccessIndex> {
        self.blocks.values_mut()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn get_pin_count(&self, block: BlockId) -> Option<u32> {
        self.blocks.get(&block).map(|e| e.pin_count())
    }
}

impl ResidentBlocks for BlockPool {
    fn resident_mut(&mut self, block: BlockId) -> Option<&mut BlockAccessIndex> {
        self.blocks.get_mut(&block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::Datablock;

    fn entry(id: i64) -> BlockAccessIndex {
        BlockAccessIndex::new(BlockId::new(id), Datablock::new())
    }

    #[test]
    fn test_block_pool_insert_and_lookup() {
        let mut pool = BlockPool::new(4);
        pool.insert(entry(3));
        assert!(pool.contains(BlockId::new(3)));
        assert_eq!(pool.len(), 1);
        assert!(pool.resident_mut(BlockId::new(3)).is_some());
        assert!(pool.resident_mut(BlockId::new(4)).is_none());
    }

    #[test]
    fn test_block_pool_victim_respects_pins() {
        let mut pool = BlockPool::new(2);
        pool.insert(entry(0));
        pool.insert(entry(1));
        assert!(pool.is_full());

        pool.pin(BlockId::new(0));
        assert_eq!(pool.victim(), Some(BlockId::new(1)));
        assert_eq!(pool.victim(), None);

        assert_eq!(pool.unpin(BlockId::new(0)), Some(0));
        assert_eq!(pool.victim(), Some(BlockId::new(0)));
    }

    #[test]
    fn test_block_pool_requeue_after_failed_eviction() {
        let mut pool = BlockPool::new(2);
        pool.insert(entry(0));
        pool.insert(entry(1));
        assert_eq!(pool.evictable_count(), 2);

        let victim = pool.victim().unwrap();
        assert_eq!(pool.evictable_count(), 1);
        pool.requeue(victim);
        assert_eq!(pool.evictable_count(), 2);
        assert!(pool.contains(victim));
    }

    #[test]
    fn test_block_pool_discard_dirty() {
        let mut pool = BlockPool::new(4);
        pool.insert(entry(0));
        pool.insert(entry(1));
        pool.get_mut(BlockId::new(1))
            .unwrap()
            .blk_mut()
            .write_bytes_at(0, b"dirty");

        assert_eq!(pool.dirty_blocks(), vec![BlockId::new(1)]);
        assert_eq!(pool.discard_dirty(), 1);
        assert!(pool.contains(BlockId::new(0)));
        assert!(!pool.contains(BlockId::new(1)));
    }

    #[test]
    fn test_block_pool_pin_count() {
        let mut pool = BlockPool::new(4);
        pool.insert(entry(2));
        assert_eq!(pool.get_pin_count(BlockId::new(2)), Some(0));
        pool.pin(BlockId::new(2));
        assert_eq!(pool.get_pin_count(BlockId::new(2)), Some(1));
        assert_eq!(pool.get_pin_count(BlockId::new(9)), None);
    }
}
