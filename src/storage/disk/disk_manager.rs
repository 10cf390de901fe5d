use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::trace;

use crate::common::{BlockId, Result, SackError, BLOCK_SIZE};
use crate::storage::page::Datablock;

use super::FileIo;

/// The main store as seen by the undo log: block-addressed reads, a write
/// path that never triggers undo logging, and a durability barrier.
pub trait MainStore {
    /// Reads the on-disk image of a block, bypassing any buffer pool.
    fn read_block_at(&self, block: BlockId) -> Result<Datablock>;

    /// Writes a block to its home slot without consulting the undo log.
    fn write_block_no_log(&self, block: BlockId, blk: &Datablock) -> Result<()>;

    /// Forces buffered writes to durable storage.
    fn force(&self) -> Result<()>;
}

/// DiskManager is responsible for reading and writing blocks to/from disk.
/// It manages a single database file of fixed-size block slots; block `n`
/// lives at byte `n * BLOCK_SIZE`.
pub struct DiskManager {
    /// The database file
    db_file: Mutex<FileIo>,
    /// Path to the database file
    db_path: String,
    /// Number of block slots in the file
    num_blocks: AtomicI64,
    /// Number of block reads performed
    num_reads: AtomicU32,
    /// Number of block writes performed
    num_writes: AtomicU32,
}

impl DiskManager {
    /// Creates a new DiskManager for the given database file path.
    /// Creates the file if it doesn't exist.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path_str = db_path.as_ref().to_string_lossy().to_string();

        let file = FileIo::open(&db_path)?;
        let num_blocks = (file.size()? / BLOCK_SIZE as u64) as i64;

        Ok(Self {
            db_file: Mutex::new(file),
            db_path: path_str,
            num_blocks: AtomicI64::new(num_blocks),
            num_reads: AtomicU32::new(0),
            num_writes: AtomicU32::new(0),
        })
    }

    fn check_range(&self, block: BlockId) -> Result<()> {
        if !block.is_valid() || block.as_i64() >= self.num_blocks.load(Ordering::Acquire) {
            return Err(SackError::BlockOutOfRange(block));
        }
        Ok(())
    }

    /// Reads a block from its slot using the used-bytes encoding.
    pub fn read_block(&self, block: BlockId) -> Result<Datablock> {
        self.check_range(block)?;

        let mut buf = vec![0u8; BLOCK_SIZE];
        let bytes_read = {
            let mut file = self.db_file.lock();
            file.seek(block.file_offset())?;
            file.read(&mut buf)?
        };
        self.num_reads.fetch_add(1, Ordering::Relaxed);

        Datablock::read_used(&mut &buf[..bytes_read]).map_err(|e| SackError::CorruptBlock {
            block,
            source: Box::new(e),
        })
    }

    /// Writes the header and used payload of a block to its slot.
    pub fn write_block(&self, block: BlockId, blk: &Datablock) -> Result<()> {
        self.check_range(block)?;

        let mut buf = BytesMut::with_capacity(BLOCK_SIZE);
        blk.write_used(&mut buf);

        let mut file = self.db_file.lock();
        file.seek(block.file_offset())?;
        file.write(&buf)?;

        self.num_writes.fetch_add(1, Ordering::Relaxed);
        trace!(block = block.as_i64(), bytes = buf.len(), "wrote block");
        Ok(())
    }

    /// Appends a new block slot and returns its id. The slot is written in
    /// full so later used-bytes writes never leave a hole at the end of file.
    /// The block only counts as part of the store once its slot is written.
    pub fn allocate_block(&self) -> Result<BlockId> {
        let mut buf = BytesMut::with_capacity(BLOCK_SIZE);
        Datablock::free().write_full(&mut buf);

        let mut file = self.db_file.lock();
        let block = BlockId::new(self.num_blocks.load(Ordering::Acquire));
        file.seek(block.file_offset())?;
        file.write(&buf)?;
        self.num_blocks.store(block.as_i64() + 1, Ordering::Release);

        self.num_writes.fetch_add(1, Ordering::Relaxed);
        Ok(block)
    }

    /// Returns the number of block slots in the store.
    pub fn get_num_blocks(&self) -> i64 {
        self.num_blocks.load(Ordering::Relaxed)
    }

    /// Returns the number of block reads performed.
    pub fn get_num_reads(&self) -> u32 {
        self.num_reads.load(Ordering::Relaxed)
    }

    /// Returns the number of block writes performed.
    pub fn get_num_writes(&self) -> u32 {
        self.num_writes.load(Ordering::Relaxed)
    }

    /// Returns the path to the database file.
    pub fn get_db_path(&self) -> &str {
        &self.db_path
    }

    /// Flushes any buffered writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.db_file.lock().sync()
    }
}

impl MainStore for DiskManager {
    fn read_block_at(&self, block: BlockId) -> Result<Datablock> {
        self.read_block(block)
    }

    fn write_block_no_log(&self, block: BlockId, blk: &Datablock) -> Result<()> {
        self.write_block(block, blk)
    }

    fn force(&self) -> Result<()> {
        self.sync()
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.db_file.get_mut().sync();
    }
}
