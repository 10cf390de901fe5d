use crate::common::BlockId;
use crate::storage::page::Datablock;

/// BlockAccessIndex binds a block number to its resident Datablock.
/// It tracks the byte cursor within the payload and how many holders have the
/// block pinned.
#[derive(Debug)]
pub struct BlockAccessIndex {
    /// The block number this entry caches
    block: BlockId,
    /// The resident copy of the block
    blk: Datablock,
    /// Cursor into the payload
    byte_index: u16,
    /// Number of holders currently using this entry
    access_count: u32,
    /// Resident copy must be reloaded from the store before use
    stale: bool,
}

impl BlockAccessIndex {
    /// Creates an unpinned entry for the given block.
    pub fn new(block: BlockId, blk: Datablock) -> Self {
        Self {
            block,
            blk,
            byte_index: 0,
            access_count: 0,
            stale: false,
        }
    }

    /// Returns the block number.
    pub fn block_id(&self) -> BlockId {
        self.block
    }

    pub fn blk(&self) -> &Datablock {
        &self.blk
    }

    pub fn blk_mut(&mut self) -> &mut Datablock {
        &mut self.blk
    }

    /// Replaces the resident copy, clearing any stale mark.
    pub fn replace_blk(&mut self, blk: Datablock) {
        self.blk = blk;
        self.stale = false;
    }

    pub fn byte_index(&self) -> u16 {
        self.byte_index
    }

    pub fn set_byte_index(&mut self, byte_index: u16) {
        self.byte_index = byte_index;
    }

    pub fn move_byte_index(&mut self, count: u16) {
        self.byte_index = self.byte_index.saturating_add(count);
    }

    /// Returns the current pin count.
    pub fn pin_count(&self) -> u32 {
        self.access_count
    }

    /// Increments the pin count and returns the new value.
    pub fn pin(&mut self) -> u32 {
        self.access_count += 1;
        self.access_count
    }

    /// Decrements the pin count and returns the new value.
    /// Returns None if the pin count was already 0.
    pub fn unpin(&mut self) -> Option<u32> {
        if self.access_count == 0 {
            return None;
        }
        self.access_count -= 1;
        Some(self.access_count)
    }

    pub fn is_dirty(&self) -> bool {
        self.blk.is_dirty()
    }

    /// Marks the resident copy as no longer loaded. It is treated as clean and
    /// the next access reloads canonical content from the store.
    pub fn invalidate(&mut self) {
        self.blk.set_dirty(false);
        self.stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_access_new() {
        let bai = BlockAccessIndex::new(BlockId::new(4), Datablock::new());
        assert_eq!(bai.block_id(), BlockId::new(4));
        assert_eq!(bai.byte_index(), 0);
        assert_eq!(bai.pin_count(), 0);
        assert!(!bai.is_dirty());
        assert!(!bai.is_stale());
    }

    #[test]
    fn test_block_access_pin_unpin() {
        let mut bai = BlockAccessIndex::new(BlockId::new(0), Datablock::new());

        assert_eq!(bai.pin(), 1);
        assert_eq!(bai.pin(), 2);
        assert_eq!(bai.unpin(), Some(1));
        assert_eq!(bai.unpin(), Some(0));
        assert_eq!(bai.unpin(), None);
    }

    #[test]
    fn test_block_access_cursor() {
        let mut bai = BlockAccessIndex::new(BlockId::new(0), Datablock::new());
        bai.set_byte_index(10);
        bai.move_byte_index(5);
        assert_eq!(bai.byte_index(), 15);
        bai.move_byte_index(u16::MAX);
        assert_eq!(bai.byte_index(), u16::MAX);
    }

    #[test]
    fn test_block_access_invalidate() {
        let mut bai = BlockAccessIndex::new(BlockId::new(0), Datablock::new());
        bai.blk_mut().write_bytes_at(0, b"x");
        assert!(bai.is_dirty());

        bai.invalidate();
        assert!(!bai.is_dirty());
        assert!(bai.is_stale());

        bai.replace_blk(Datablock::new());
        assert!(!bai.is_stale());
    }
}
