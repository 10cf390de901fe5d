use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::buffer::{BlockAccessIndex, BlockPool};
use crate::common::{
    BlockId, Mirror, ObjectPtr, Result, SackConfig, SackError, DATA_SIZE, INVALID_BLOCK_ID,
    LOG_EXTENSION, MIN_POOL_SIZE, NEW_NODE_SLACK,
};
use crate::storage::disk::{DiskManager, FreeList};
use crate::storage::page::Datablock;
use crate::undo::{RollbackSummary, UndoLog};

/// Returns the undo log path for a database file: the database path with
/// [`LOG_EXTENSION`] appended.
pub fn log_path_for<P: AsRef<Path>>(db_path: P) -> PathBuf {
    let mut path = db_path.as_ref().as_os_str().to_os_string();
    path.push(LOG_EXTENSION);
    PathBuf::from(path)
}

/// BlockDbIo is the block-level I/O of one database session.
///
/// It keeps a single "current" block with a byte cursor, loads blocks into the
/// pool on demand, hands out new blocks, and ends transactions. Every dirty
/// block passes through the undo log before it is written to its home slot,
/// so the store can always be brought back to the state at the start of the
/// transaction.
pub struct BlockDbIo {
    /// The main store
    disk: Arc<DiskManager>,
    /// Resident blocks
    pool: BlockPool,
    /// Pre-images of the in-flight transaction
    undo: UndoLog,
    /// Reusable block slots
    free_list: FreeList,
    /// The block the cursor is on, pinned while current
    current: Option<BlockId>,
    /// Last block a new node was placed in
    new_node_pos_blk: BlockId,
    /// Blocks handed out by the allocator this transaction
    fresh: HashSet<BlockId>,
    /// Database key count
    key_count: i64,
}

impl BlockDbIo {
    /// Opens a session on the database at `db_path`, creating the store and
    /// its undo log if needed. Outstanding undo entries left by a crash are
    /// rolled back before this returns.
    pub fn open<P: AsRef<Path>>(db_path: P, config: SackConfig) -> Result<Self> {
        let disk = Arc::new(DiskManager::new(&db_path)?);
        Self::with_disk_manager(disk, log_path_for(&db_path), config)
    }

    /// Opens a session over an existing store with an explicit log path.
    pub fn with_disk_manager<P: AsRef<Path>>(
        disk: Arc<DiskManager>,
        log_path: P,
        config: SackConfig,
    ) -> Result<Self> {
        let undo = UndoLog::open(log_path, &*disk, config.sync_log)?;
        let key_count = undo.key_count();
        if let Some(recovery) = undo.recovery() {
            info!(
                db = disk.get_db_path(),
                entries = recovery.entries,
                "recovered database from undo log"
            );
        }

        Ok(Self {
            disk,
            pool: BlockPool::new(config.pool_size.max(MIN_POOL_SIZE)),
            undo,
            free_list: FreeList::new(),
            current: None,
            new_node_pos_blk: INVALID_BLOCK_ID,
            fresh: HashSet::new(),
            key_count,
        })
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    pub fn undo_log(&self) -> &UndoLog {
        &self.undo
    }

    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    pub fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    /// Returns the current block number.
    pub fn current_block(&self) -> Option<BlockId> {
        self.current
    }

    /// Returns the last insertion block used for clustering.
    pub fn new_node_position_block(&self) -> BlockId {
        self.new_node_pos_blk
    }

    fn current_entry(&self) -> Result<&BlockAccessIndex> {
        self.current
            .and_then(|block| self.pool.get(block))
            .ok_or(SackError::NoCurrentBlock)
    }

    fn current_entry_mut(&mut self) -> Result<&mut BlockAccessIndex> {
        match self.current {
            Some(block) => self.pool.get_mut(block).ok_or(SackError::NoCurrentBlock),
            None => Err(SackError::NoCurrentBlock),
        }
    }

    /// Returns the current block.
    pub fn datablock(&self) -> Result<&Datablock> {
        Ok(self.current_entry()?.blk())
    }

    /// Returns the current block for mutation. Callers mark it dirty.
    pub fn datablock_mut(&mut self) -> Result<&mut Datablock> {
        Ok(self.current_entry_mut()?.blk_mut())
    }

    pub fn byte_index(&self) -> Result<u16> {
        Ok(self.current_entry()?.byte_index())
    }

    pub fn set_byte_index(&mut self, byte_index: u16) -> Result<()> {
        self.current_entry_mut()?.set_byte_index(byte_index);
        Ok(())
    }

    /// Undo state a block should carry when it is read into the pool. The
    /// mirror stored on disk may be left over from an earlier transaction, so
    /// it is rebuilt from what this transaction has logged and allocated.
    fn resolve_mirror(&self, block: BlockId) -> Mirror {
        if let Some(offset) = self.undo.logged_offset(block) {
            Mirror::LoggedAt(offset)
        } else if self.fresh.contains(&block) {
            Mirror::Free
        } else {
            Mirror::NotLogged
        }
    }

    fn load_from_disk(&self, block: BlockId) -> Result<Datablock> {
        let mut blk = self.disk.read_block(block)?;
        blk.set_mirror(self.resolve_mirror(block));
        blk.set_dirty(false);
        Ok(blk)
    }

    /// Makes `block` resident and current in the pool, reloading a stale copy.
    fn fetch_block(&mut self, block: BlockId) -> Result<()> {
        match self.pool.get(block).map(|entry| entry.is_stale()) {
            Some(false) => return Ok(()),
            Some(true) => {
                let blk = self.load_from_disk(block)?;
                if let Some(entry) = self.pool.get_mut(block) {
                    entry.replace_blk(blk);
                }
                return Ok(());
            }
            None => {}
        }

        let blk = self.load_from_disk(block)?;
        self.make_room()?;
        self.pool.insert(BlockAccessIndex::new(block, blk));
        Ok(())
    }

    /// Evicts unpinned blocks until the pool has a free slot.
    fn make_room(&mut self) -> Result<()> {
        while self.pool.is_full() {
            let victim = self.pool.victim().ok_or(SackError::BufferPoolFull)?;
            if let Err(e) = self.flush_block(victim) {
                self.pool.requeue(victim);
                return Err(e);
            }
            self.pool.remove(victim);
            debug!(block = victim.as_i64(), "evicted block");
        }
        Ok(())
    }

    /// Writes a dirty resident block home, logging its pre-image first.
    /// Returns whether anything was written.
    fn flush_block(&mut self, block: BlockId) -> Result<bool> {
        let Some(entry) = self.pool.get_mut(block) else {
            return Ok(false);
        };
        if !entry.is_dirty() {
            return Ok(false);
        }

        self.undo
            .write_log_entry(block, entry.blk_mut(), &*self.disk)?;
        self.disk.write_block(block, entry.blk())?;
        entry.blk_mut().set_dirty(false);
        Ok(true)
    }

    /// Writes every dirty resident block home through the undo log. Returns
    /// how many blocks were written.
    pub fn flush_all(&mut self) -> Result<usize> {
        let mut flushed = 0;
        for block in self.pool.dirty_blocks() {
            if self.flush_block(block)? {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    fn set_current(&mut self, block: BlockId) {
        self.pool.pin(block);
        if let Some(entry) = self.pool.get_mut(block) {
            entry.set_byte_index(0);
        }
        self.current = Some(block);
    }

    fn release_current(&mut self) {
        if let Some(block) = self.current.take() {
            self.pool.unpin(block);
        }
    }

    /// Makes `block` current with the cursor at 0, releasing the previous
    /// current block.
    pub fn find_or_add_block(&mut self, block: BlockId) -> Result<()> {
        if self.current == Some(block) {
            self.fetch_block(block)?;
            return self.set_byte_index(0);
        }
        self.release_current();
        self.fetch_block(block)?;
        self.set_current(block);
        Ok(())
    }

    /// Positions the cursor at `ptr`. The sentinel block is rejected before
    /// any I/O.
    pub fn objseek(&mut self, ptr: ObjectPtr) -> Result<()> {
        if ptr.is_empty() {
            return Err(SackError::SentinelSeek);
        }
        self.find_or_add_block(ptr.block)?;
        self.set_byte_index(ptr.offset)
    }

    /// Positions the cursor at the start of `block`.
    pub fn objseek_block(&mut self, block: BlockId) -> Result<()> {
        self.objseek(ObjectPtr::for_block(block))
    }

    /// Follows the current block's next link. Returns false, leaving the
    /// cursor where it is, at the end of the chain.
    pub fn advance_chain(&mut self) -> Result<bool> {
        let next = self.datablock()?.next_block();
        if !next.is_valid() {
            return Ok(false);
        }
        self.find_or_add_block(next)?;
        Ok(true)
    }

    /// Takes a block from the free list or extends the store, and installs an
    /// empty free block for it in the pool.
    fn allocate_block(&mut self) -> Result<BlockId> {
        let block = match self.free_list.allocate() {
            Some(block) => block,
            None => self.disk.allocate_block()?,
        };
        self.fresh.insert(block);

        let mut blk = Datablock::free();
        blk.set_dirty(true);
        if let Some(entry) = self.pool.get_mut(block) {
            entry.replace_blk(blk);
        } else {
            self.make_room()?;
            self.pool.insert(BlockAccessIndex::new(block, blk));
        }
        debug!(block = block.as_i64(), "allocated block");
        Ok(block)
    }

    /// Allocates a block, links it into the chain right after the current
    /// block and makes it current.
    pub fn acquire_block(&mut self) -> Result<BlockId> {
        let block = self.allocate_block()?;
        self.pool.pin(block);

        if let Some(prev) = self.current {
            let old_next = match self.pool.get_mut(prev) {
                Some(entry) => {
                    let old_next = entry.blk().next_block();
                    entry.blk_mut().set_next_block(block);
                    entry.blk_mut().set_dirty(true);
                    old_next
                }
                None => INVALID_BLOCK_ID,
            };
            if let Some(entry) = self.pool.get_mut(block) {
                entry.blk_mut().set_prev_block(prev);
                entry.blk_mut().set_next_block(old_next);
            }
            if old_next.is_valid() {
                self.fetch_block(old_next)?;
                if let Some(entry) = self.pool.get_mut(old_next) {
                    entry.blk_mut().set_prev_block(block);
                    entry.blk_mut().set_dirty(true);
                }
            }
        }

        self.release_current();
        self.current = Some(block);
        self.set_byte_index(0)?;
        Ok(block)
    }

    /// Takes a block from the free chain (or extends the store), links it to
    /// nothing and makes it current. Stolen blocks are never undo-logged.
    pub fn steal_block(&mut self) -> Result<BlockId> {
        self.release_current();
        let block = self.allocate_block()?;
        self.set_current(block);
        Ok(block)
    }

    /// Releases a block for reuse once this transaction commits.
    pub fn free_block(&mut self, block: BlockId) {
        self.free_list.release(block);
    }

    /// Chooses where a new node goes, clustering it into the last insertion
    /// block while that block still has room.
    pub fn compute_new_node_position(&mut self) -> Result<ObjectPtr> {
        if !self.new_node_pos_blk.is_valid() {
            self.steal_block()?;
        } else {
            self.objseek_block(self.new_node_pos_blk)?;
            if self.datablock()?.bytes_used() as usize + NEW_NODE_SLACK > DATA_SIZE {
                self.steal_block()?;
            }
        }
        let entry = self.current_entry()?;
        Ok(ObjectPtr::new(entry.block_id(), entry.blk().bytes_used()))
    }

    /// Remembers the current block as the last insertion block.
    pub fn record_new_node_position(&mut self) -> Result<()> {
        self.new_node_pos_blk = self.current.ok_or(SackError::NoCurrentBlock)?;
        Ok(())
    }

    /// Writes `src` at the cursor, continuing into the next chained block
    /// (acquiring one at the end of the chain) when the current one fills.
    pub fn write_bytes(&mut self, src: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < src.len() {
            let entry = self.current_entry_mut()?;
            let index = entry.byte_index() as usize;
            if index >= DATA_SIZE {
                if !self.advance_chain()? {
                    self.acquire_block()?;
                }
                continue;
            }
            let n = entry.blk_mut().write_bytes_at(index, &src[written..]);
            entry.move_byte_index(n as u16);
            written += n;
        }
        Ok(written)
    }

    /// Reads into `dst` from the cursor, continuing through chained blocks.
    /// Stops at the high-water mark of a partially filled block or at the end
    /// of the chain. Returns bytes read.
    pub fn read_bytes(&mut self, dst: &mut [u8]) -> Result<usize> {
        let mut read = 0;
        while read < dst.len() {
            let entry = self.current_entry_mut()?;
            let index = entry.byte_index() as usize;
            let n = entry.blk().read_bytes_at(index, &mut dst[read..]);
            if n == 0 {
                if index >= DATA_SIZE && self.advance_chain()? {
                    continue;
                }
                break;
            }
            entry.move_byte_index(n as u16);
            read += n;
        }
        Ok(read)
    }

    pub fn key_count(&self) -> i64 {
        self.key_count
    }

    /// Changes the key count. It is persisted by [`BlockDbIo::commit`]; the
    /// undo log header holds the last committed count, which a rollback or
    /// crash recovery restores.
    pub fn set_key_count(&mut self, key_count: i64) {
        self.key_count = key_count;
    }

    /// Releases the current block without ending the transaction.
    pub fn dealloc_outstanding(&mut self) {
        self.release_current();
    }

    /// Releases the current block and commits.
    pub fn dealloc_outstanding_commit(&mut self) -> Result<()> {
        self.dealloc_outstanding();
        self.commit()
    }

    /// Releases the current block and rolls back, resident blocks included.
    pub fn dealloc_outstanding_rollback(&mut self) -> Result<RollbackSummary> {
        self.dealloc_outstanding();
        self.rollback()
    }

    /// Commits the transaction: every dirty block is written home (its
    /// pre-image logged first), the store is forced, then the undo log is
    /// finalized.
    pub fn commit(&mut self) -> Result<()> {
        let flushed = self.flush_all()?;
        self.disk.sync()?;
        self.undo
            .commit_with_key_count(&mut self.pool, self.key_count)?;

        for block in self.fresh.drain() {
            if let Some(entry) = self.pool.get_mut(block) {
                if entry.blk().mirror() == Mirror::Free {
                    entry.blk_mut().set_mirror(Mirror::NotLogged);
                }
            }
        }
        self.free_list.commit();

        info!(flushed, key_count = self.key_count, "transaction committed");
        Ok(())
    }

    /// Rolls back the transaction: pre-images are replayed into the store
    /// and any resident copies, and blocks that never reached the store are
    /// dropped from the pool.
    pub fn rollback(&mut self) -> Result<RollbackSummary> {
        self.release_current();
        let summary = self.undo.rollback_cache(&*self.disk, &mut self.pool)?;
        let discarded = self.pool.discard_dirty();

        for block in self.fresh.drain() {
            self.pool.remove(block);
            self.free_list.restore(block);
            if self.new_node_pos_blk == block {
                self.new_node_pos_blk = INVALID_BLOCK_ID;
            }
        }
        self.free_list.abort();

        self.key_count = summary.key_count;

        info!(
            restored = summary.entries,
            discarded,
            key_count = self.key_count,
            "transaction rolled back"
        );
        Ok(summary)
    }

    /// Clears the undo log without replaying it. The session's key count is
    /// written back as the committed count.
    pub fn reset_log(&mut self) -> Result<()> {
        self.undo.reset()?;
        self.undo.update_key_count(self.key_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_session(pool_size: usize) -> (BlockDbIo, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = SackConfig::default()
            .with_pool_size(pool_size)
            .with_sync_log(false);
        let session = BlockDbIo::open(dir.path().join("test.db"), config).unwrap();
        (session, dir)
    }

    #[test]
    fn test_log_path_for() {
        assert_eq!(log_path_for("/tmp/x.db"), PathBuf::from("/tmp/x.db.log"));
    }

    #[test]
    fn test_no_current_block() {
        let (mut session, _dir) = open_session(4);
        assert!(matches!(session.datablock(), Err(SackError::NoCurrentBlock)));
        assert!(matches!(
            session.record_new_node_position(),
            Err(SackError::NoCurrentBlock)
        ));
    }

    #[test]
    fn test_objseek_sentinel_rejected() {
        let (mut session, _dir) = open_session(4);
        assert!(matches!(
            session.objseek(ObjectPtr::EMPTY),
            Err(SackError::SentinelSeek)
        ));
        assert_eq!(session.disk_manager().get_num_reads(), 0);
    }

    #[test]
    fn test_steal_block_is_free_and_current() {
        let (mut session, _dir) = open_session(4);
        let block = session.steal_block().unwrap();
        assert_eq!(session.current_block(), Some(block));
        assert_eq!(session.datablock().unwrap().mirror(), Mirror::Free);
        assert_eq!(session.pool().get_pin_count(block), Some(1));
    }

    #[test]
    fn test_find_or_add_resets_cursor_and_moves_pin() {
        let (mut session, _dir) = open_session(4);
        let a = session.steal_block().unwrap();
        let b = session.steal_block().unwrap();
        assert_eq!(session.pool().get_pin_count(a), Some(0));

        session.set_byte_index(7).unwrap();
        session.find_or_add_block(b).unwrap();
        assert_eq!(session.byte_index().unwrap(), 0);

        session.find_or_add_block(a).unwrap();
        assert_eq!(session.pool().get_pin_count(a), Some(1));
        assert_eq!(session.pool().get_pin_count(b), Some(0));
    }

    #[test]
    fn test_acquire_block_links_chain() {
        let (mut session, _dir) = open_session(4);
        let first = session.steal_block().unwrap();
        let second = session.acquire_block().unwrap();

        assert_eq!(session.datablock().unwrap().prev_block(), first);
        session.objseek_block(first).unwrap();
        assert_eq!(session.datablock().unwrap().next_block(), second);

        assert!(session.advance_chain().unwrap());
        assert_eq!(session.current_block(), Some(second));
        assert!(!session.advance_chain().unwrap());
        assert_eq!(session.current_block(), Some(second));
    }

    #[test]
    fn test_acquire_block_splices_mid_chain() {
        let (mut session, _dir) = open_session(8);
        let a = session.steal_block().unwrap();
        let c = session.acquire_block().unwrap();
        session.objseek_block(a).unwrap();
        let b = session.acquire_block().unwrap();

        session.objseek_block(a).unwrap();
        assert_eq!(session.datablock().unwrap().next_block(), b);
        session.objseek_block(b).unwrap();
        assert_eq!(session.datablock().unwrap().next_block(), c);
        session.objseek_block(c).unwrap();
        assert_eq!(session.datablock().unwrap().prev_block(), b);
    }

    #[test]
    fn test_key_count_persisted_at_commit() {
        let (mut session, _dir) = open_session(4);
        session.set_key_count(10);
        session.commit().unwrap();

        session.set_key_count(11);
        session.set_key_count(12);
        assert_eq!(session.undo_log().key_count(), 10);

        session.rollback().unwrap();
        assert_eq!(session.key_count(), 10);
    }

    #[test]
    fn test_small_pool_is_raised_to_minimum() {
        let (mut session, _dir) = open_session(1);
        assert_eq!(session.pool().pool_size(), MIN_POOL_SIZE);

        let first = session.steal_block().unwrap();
        let second = session.steal_block().unwrap();
        session.objseek_block(first).unwrap();
        session.acquire_block().unwrap();
        session.objseek_block(first).unwrap();
        assert!(session.advance_chain().unwrap());
        assert_ne!(session.current_block(), Some(second));
    }

    #[test]
    fn test_buffer_pool_full_when_all_pinned() {
        let (mut session, _dir) = open_session(MIN_POOL_SIZE);
        for _ in 0..MIN_POOL_SIZE {
            let block = session.steal_block().unwrap();
            session.pool.pin(block);
        }
        assert!(matches!(
            session.steal_block(),
            Err(SackError::BufferPoolFull)
        ));
    }
}
