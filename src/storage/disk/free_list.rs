use std::collections::{BTreeSet, HashSet};

use crate::common::BlockId;

/// FreeList tracks block slots that can be reused by `steal_block` and
/// `acquire_block`.
///
/// Blocks released during a transaction are held as pending and only become
/// allocatable once the transaction commits: until then a rollback may bring
/// back the structures that still reference them.
#[derive(Debug, Default)]
pub struct FreeList {
    /// Blocks available for allocation, lowest first to keep the store dense
    free: BTreeSet<BlockId>,
    /// Blocks released by the in-flight transaction
    pending: HashSet<BlockId>,
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lowest free block, if any.
    pub fn allocate(&mut self) -> Option<BlockId> {
        self.free.pop_first()
    }

    /// Releases a block; it becomes allocatable after [`FreeList::commit`].
    pub fn release(&mut self, block: BlockId) {
        if block.is_valid() && !self.free.contains(&block) {
            self.pending.insert(block);
        }
    }

    /// Returns a block straight to the free set, bypassing the pending stage.
    pub fn restore(&mut self, block: BlockId) {
        if block.is_valid() {
            self.pending.remove(&block);
            self.free.insert(block);
        }
    }

    /// Publishes the pending releases of a committed transaction.
    pub fn commit(&mut self) {
        self.free.extend(self.pending.drain());
    }

    /// Forgets the pending releases of an aborted transaction.
    pub fn abort(&mut self) {
        self.pending.clear();
    }

    pub fn is_pending(&self, block: BlockId) -> bool {
        self.pending.contains(&block)
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_released_blocks_wait_for_commit() {
        let mut list = FreeList::new();
        list.release(BlockId::new(4));
        assert!(list.is_pending(BlockId::new(4)));
        assert_eq!(list.allocate(), None);

        list.commit();
        assert_eq!(list.allocate(), Some(BlockId::new(4)));
        assert_eq!(list.allocate(), None);
    }

    #[test]
    fn test_abort_drops_pending_releases() {
        let mut list = FreeList::new();
        list.release(BlockId::new(2));
        list.abort();
        list.commit();
        assert_eq!(list.free_count(), 0);
    }

    #[test]
    fn test_allocate_lowest_first() {
        let mut list = FreeList::new();
        for id in [9, 3, 6] {
            list.restore(BlockId::new(id));
        }
        assert_eq!(list.allocate(), Some(BlockId::new(3)));
        assert_eq!(list.allocate(), Some(BlockId::new(6)));
        assert_eq!(list.allocate(), Some(BlockId::new(9)));
    }

    #[test]
    fn test_sentinel_is_never_released() {
        let mut list = FreeList::new();
        list.release(BlockId::new(-1));
        list.restore(BlockId::new(-1));
        list.commit();
        assert_eq!(list.free_count(), 0);
    }
}
