use std::collections::HashMap;
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, info, warn};

use crate::buffer::ResidentBlocks;
use crate::common::{
    BlockId, Mirror, Result, SackError, BLOCK_SIZE, DATA_SIZE, LOG_HEADER_SIZE,
    LOG_KEY_COUNT_OFFSET, MIRROR_FIELD_OFFSET,
};
use crate::storage::disk::{FileIo, MainStore};
use crate::storage::page::Datablock;

/// Undo log file layout (big-endian):
///
/// +----------------------+
/// | entry_count   (i32)  |  offset 0
/// | key_count     (i64)  |  offset 4
/// +----------------------+
/// | record 0             |  offset 12
/// | record 1             |  offset 12 + BLOCK_SIZE
/// | ...                  |
/// +----------------------+
///
/// Each record is a full block encoding whose mirror slot holds the number
/// of the block it is a pre-image of.
///
/// Live blocks point back into this file through their mirror: a block whose
/// mirror is [`Mirror::NotLogged`] has its on-disk image copied here the
/// first time it is written in a transaction, after which its mirror is
/// [`Mirror::LoggedAt`] the record offset. [`Mirror::Free`] blocks are never
/// logged.
pub struct UndoRecord {
    /// Block this record is a pre-image of
    origin: BlockId,
    /// The pre-image itself
    image: Datablock,
}

impl UndoRecord {
    pub fn new(origin: BlockId, image: Datablock) -> Self {
        Self { origin, image }
    }

    pub fn origin(&self) -> BlockId {
        self.origin
    }

    pub fn image(&self) -> &Datablock {
        &self.image
    }

    pub fn into_image(self) -> Datablock {
        self.image
    }

    fn encode(&self, dst: &mut BytesMut) {
        self.image.put_header(dst, self.origin.as_i64());
        dst.extend_from_slice(self.image.data());
    }

    /// Decodes a record. The image comes back unlogged and dirty-free, ready
    /// to be written home.
    fn decode<B: Buf>(src: &mut B) -> Result<Self> {
        let (mut image, origin) = Datablock::get_header(src)?;
        image.check_bytes_used()?;
        image.get_payload(src, DATA_SIZE)?;
        image.set_mirror(Mirror::NotLogged);
        Ok(Self {
            origin: BlockId::new(origin),
            image,
        })
    }
}

/// Outcome of replaying the undo log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackSummary {
    /// Records replayed
    pub entries: u32,
    /// Key count persisted in the log header when the replay started
    pub key_count: i64,
}

/// UndoLog keeps the pre-images of blocks modified by the in-flight
/// transaction so it can be rolled back after a crash or an abort.
pub struct UndoLog {
    /// The log file
    file: FileIo,
    /// Records currently in the log
    num_entries: u32,
    /// Persisted key count of the database
    key_count: i64,
    /// Blocks logged this transaction and their record offsets
    logged: HashMap<BlockId, u64>,
    /// Whether to fsync after each record
    sync_log: bool,
    /// Replay performed by `open`, if the log had outstanding entries
    recovery: Option<RollbackSummary>,
}

impl UndoLog {
    /// Opens (or creates) the undo log at `path`. A log left with entries by
    /// a crash is rolled back against `store` before this returns.
    pub fn open<P: AsRef<Path>, S: MainStore + ?Sized>(
        path: P,
        store: &S,
        sync_log: bool,
    ) -> Result<Self> {
        let file = FileIo::open(path)?;
        let mut log = Self {
            file,
            num_entries: 0,
            key_count: 0,
            logged: HashMap::new(),
            sync_log,
            recovery: None,
        };

        if log.file.size()? > 0 {
            log.read_header()?;
        } else {
            log.clear()?;
        }

        if log.num_entries > 0 {
            warn!(
                log = %log.file.path().display(),
                entries = log.num_entries,
                "undo log has outstanding entries, rolling back"
            );
            let summary = log.rollback(store)?;
            log.recovery = Some(summary);
        }

        Ok(log)
    }

    /// Returns the number of records currently in the log.
    pub fn num_entries(&self) -> u32 {
        self.num_entries
    }

    /// Returns the persisted key count.
    pub fn key_count(&self) -> i64 {
        self.key_count
    }

    /// Returns the replay done while opening, if there was one.
    pub fn recovery(&self) -> Option<RollbackSummary> {
        self.recovery
    }

    /// Returns the record offset of a block logged this transaction.
    pub fn logged_offset(&self, block: BlockId) -> Option<u64> {
        self.logged.get(&block).copied()
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    fn record_offset(index: u32) -> u64 {
        LOG_HEADER_SIZE + index as u64 * BLOCK_SIZE as u64
    }

    /// Fails unless the file holds every record the header claims.
    fn check_size(&self) -> Result<()> {
        let size = self.file.size()?;
        let required = Self::record_offset(self.num_entries);
        if size < required {
            return Err(SackError::LogCorrupted(format!(
                "log is {} bytes but claims {} entries ({} bytes)",
                size, self.num_entries, required
            )));
        }
        Ok(())
    }

    /// Captures the pre-image of `block` before its modified copy `blk` is
    /// written home.
    ///
    /// Only the first write of a block per transaction is logged: blocks whose
    /// mirror is anything other than [`Mirror::NotLogged`] are skipped. The
    /// pre-image is read from the store, never from `blk`, so the log holds
    /// the state before this transaction touched the block.
    pub fn write_log_entry<S: MainStore + ?Sized>(
        &mut self,
        block: BlockId,
        blk: &mut Datablock,
        store: &S,
    ) -> Result<()> {
        if blk.mirror() != Mirror::NotLogged {
            return Ok(());
        }

        self.check_size()?;
        let offset = Self::record_offset(self.num_entries);

        let pre_image = store.read_block_at(block)?;
        let record = UndoRecord::new(block, pre_image);
        let mut buf = BytesMut::with_capacity(BLOCK_SIZE);
        record.encode(&mut buf);

        self.file.seek(offset)?;
        self.file.write(&buf)?;
        if self.sync_log {
            // record must be durable before the count that makes it valid
            self.file.sync()?;
        }

        blk.set_mirror(Mirror::LoggedAt(offset));
        self.logged.insert(block, offset);
        self.num_entries += 1;

        self.file.seek(0)?;
        self.file.write_i32(self.num_entries as i32)?;
        if self.sync_log {
            self.file.sync()?;
        }

        debug!(block = block.as_i64(), offset, entries = self.num_entries, "logged pre-image");
        Ok(())
    }

    /// Finalizes a successful transaction.
    ///
    /// Every resident block named by a record is detached from the log by
    /// resetting its mirror to [`Mirror::NotLogged`], then the log is cleared.
    /// Block content in the store is never touched.
    pub fn commit<R: ResidentBlocks + ?Sized>(&mut self, pool: &mut R) -> Result<()> {
        self.commit_with_key_count(pool, self.key_count)
    }

    /// Same as [`UndoLog::commit`], additionally storing the committed key
    /// count. The count and the cleared entry count reach the header in one
    /// write, so a crash leaves either the old transaction with the old
    /// count or the new state with the new count.
    pub fn commit_with_key_count<R: ResidentBlocks + ?Sized>(
        &mut self,
        pool: &mut R,
        key_count: i64,
    ) -> Result<()> {
        for i in 0..self.num_entries {
            self.file.seek(Self::record_offset(i) + MIRROR_FIELD_OFFSET as u64)?;
            let origin = BlockId::new(self.file.read_i64()?);
            if let Some(entry) = pool.resident_mut(origin) {
                entry.blk_mut().set_mirror(Mirror::NotLogged);
            }
        }

        if self.num_entries > 0 {
            info!(entries = self.num_entries, "undo log committed");
        }
        let key_count_changed = key_count != self.key_count;
        self.key_count = key_count;
        if self.num_entries > 0 || key_count_changed {
            self.clear()?;
        }
        Ok(())
    }

    /// Replays every record into the store, then clears the log.
    ///
    /// Runs at open when a crash left entries behind. Restores are forced to
    /// durable storage before the log is cleared, so a crash part way through
    /// simply repeats the replay on the next open.
    pub fn rollback<S: MainStore + ?Sized>(&mut self, store: &S) -> Result<RollbackSummary> {
        self.replay(store, None)
    }

    /// Same replay as [`UndoLog::rollback`], additionally overwriting any
    /// resident copy of a restored block and marking it as not loaded.
    pub fn rollback_cache<S: MainStore + ?Sized, R: ResidentBlocks>(
        &mut self,
        store: &S,
        pool: &mut R,
    ) -> Result<RollbackSummary> {
        self.replay(store, Some(pool as &mut dyn ResidentBlocks))
    }

    fn replay<S: MainStore + ?Sized>(
        &mut self,
        store: &S,
        mut pool: Option<&mut dyn ResidentBlocks>,
    ) -> Result<RollbackSummary> {
        self.read_header()?;
        self.check_size()?;
        let summary = RollbackSummary {
            entries: self.num_entries,
            key_count: self.key_count,
        };

        let mut buf = vec![0u8; BLOCK_SIZE];
        for i in 0..self.num_entries {
            let offset = Self::record_offset(i);
            self.file.seek(offset)?;
            let bytes_read = self.file.read(&mut buf)?;
            if bytes_read != BLOCK_SIZE {
                return Err(SackError::LogCorrupted(format!(
                    "record {} at offset {} is {} bytes",
                    i, offset, bytes_read
                )));
            }
            let record = UndoRecord::decode(&mut &buf[..]).map_err(|e| {
                SackError::LogCorrupted(format!("record {} at offset {}: {}", i, offset, e))
            })?;
            let origin = record.origin();

            self.check_consistency(store, origin, offset);

            if let Some(pool) = pool.as_mut() {
                if let Some(entry) = pool.resident_mut(origin) {
                    record.image().clone_into(entry.blk_mut());
                    entry.invalidate();
                }
            }

            debug!(block = origin.as_i64(), offset, "restoring pre-image");
            store.write_block_no_log(origin, record.image())?;
        }

        store.force()?;
        if summary.entries > 0 {
            info!(entries = summary.entries, key_count = summary.key_count, "undo log rolled back");
        }
        self.clear_if_modified()?;
        Ok(summary)
    }

    /// The live block should point at the record being restored. It may not
    /// when the crash hit between logging and writing the block home, in which
    /// case the store still holds the pre-image and restoring is harmless, so
    /// a mismatch is only reported.
    fn check_consistency<S: MainStore + ?Sized>(&self, store: &S, origin: BlockId, offset: u64) {
        match store.read_block_at(origin) {
            Ok(live) if live.mirror() == Mirror::LoggedAt(offset) => {}
            Ok(live) => debug!(
                block = origin.as_i64(),
                offset,
                mirror = live.mirror().to_raw(),
                "recovery inconsistency, live block does not point at its record"
            ),
            Err(e) => debug!(block = origin.as_i64(), error = %e, "live block unreadable before restore"),
        }
    }

    /// Clears the header, key count included, without replaying anything.
    pub fn reset(&mut self) -> Result<()> {
        self.key_count = 0;
        self.clear()
    }

    /// Persists the database key count in the log header.
    pub fn update_key_count(&mut self, key_count: i64) -> Result<()> {
        self.file.seek(LOG_KEY_COUNT_OFFSET)?;
        self.file.write_i64(key_count)?;
        if self.sync_log {
            self.file.sync()?;
        }
        self.key_count = key_count;
        debug!(key_count, "undo log key count updated");
        Ok(())
    }

    fn read_header(&mut self) -> Result<()> {
        let size = self.file.size()?;
        if size < LOG_HEADER_SIZE {
            return Err(SackError::LogCorrupted(format!(
                "log is {} bytes, shorter than its header",
                size
            )));
        }
        self.file.seek(0)?;
        let entries = self.file.read_i32()?;
        if entries < 0 {
            return Err(SackError::LogCorrupted(format!("negative entry count {}", entries)));
        }
        self.num_entries = entries as u32;
        self.key_count = self.file.read_i64()?;
        Ok(())
    }

    /// Drops every record. The key count survives: after a commit it is the
    /// committed count, after a replay the count the transaction started with.
    fn clear(&mut self) -> Result<()> {
        let mut header = BytesMut::with_capacity(LOG_HEADER_SIZE as usize);
        header.put_i32(0);
        header.put_i64(self.key_count);
        self.file.seek(0)?;
        self.file.write(&header)?;
        self.file.set_len(LOG_HEADER_SIZE)?;
        self.file.sync()?;
        self.num_entries = 0;
        self.logged.clear();
        debug!("undo log cleared");
        Ok(())
    }

    fn clear_if_modified(&mut self) -> Result<()> {
        if self.num_entries > 0 {
            self.clear()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BlockAccessIndex, BlockPool};
    use crate::storage::disk::DiskManager;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        dm: DiskManager,
        log_path: std::path::PathBuf,
    }

    fn fixture(blocks: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let dm = DiskManager::new(dir.path().join("test.db")).unwrap();
        for i in 0..blocks {
            let block = dm.allocate_block().unwrap();
            let mut blk = Datablock::new();
            blk.write_bytes_at(0, format!("original {}", i).as_bytes());
            dm.write_block(block, &blk).unwrap();
        }
        let log_path = dir.path().join("test.db.log");
        Fixture {
            _dir: dir,
            dm,
            log_path,
        }
    }

    fn modified(fx: &Fixture, block: BlockId, text: &[u8]) -> Datablock {
        let mut blk = fx.dm.read_block(block).unwrap();
        blk.set_mirror(Mirror::NotLogged);
        blk.write_bytes_at(0, text);
        blk
    }

    #[test]
    fn test_open_creates_empty_log() {
        let fx = fixture(0);
        let log = UndoLog::open(&fx.log_path, &fx.dm, false).unwrap();
        assert_eq!(log.num_entries(), 0);
        assert_eq!(log.recovery(), None);
        assert_eq!(std::fs::metadata(&fx.log_path).unwrap().len(), LOG_HEADER_SIZE);
    }

    #[test]
    fn test_write_log_entry_sets_mirror_offset() {
        let fx = fixture(2);
        let mut log = UndoLog::open(&fx.log_path, &fx.dm, false).unwrap();

        let mut blk = modified(&fx, BlockId::new(1), b"changed");
        log.write_log_entry(BlockId::new(1), &mut blk, &fx.dm).unwrap();

        assert_eq!(blk.mirror(), Mirror::LoggedAt(LOG_HEADER_SIZE));
        assert_eq!(log.num_entries(), 1);
        assert_eq!(log.logged_offset(BlockId::new(1)), Some(LOG_HEADER_SIZE));
        assert_eq!(
            std::fs::metadata(&fx.log_path).unwrap().len(),
            LOG_HEADER_SIZE + BLOCK_SIZE as u64
        );
    }

    #[test]
    fn test_write_log_entry_skips_free_and_logged_blocks() {
        let fx = fixture(1);
        let mut log = UndoLog::open(&fx.log_path, &fx.dm, false).unwrap();

        let mut free = Datablock::free();
        log.write_log_entry(BlockId::new(0), &mut free, &fx.dm).unwrap();
        let mut logged = Datablock::new();
        logged.set_mirror(Mirror::LoggedAt(12));
        log.write_log_entry(BlockId::new(0), &mut logged, &fx.dm).unwrap();

        assert_eq!(log.num_entries(), 0);
    }

    #[test]
    fn test_record_holds_origin_block() {
        let fx = fixture(3);
        let mut log = UndoLog::open(&fx.log_path, &fx.dm, false).unwrap();
        let mut blk = modified(&fx, BlockId::new(2), b"changed");
        log.write_log_entry(BlockId::new(2), &mut blk, &fx.dm).unwrap();

        let bytes = std::fs::read(&fx.log_path).unwrap();
        let record = UndoRecord::decode(&mut &bytes[LOG_HEADER_SIZE as usize..]).unwrap();
        assert_eq!(record.origin(), BlockId::new(2));
        assert_eq!(&record.image().data()[..10], b"original 2");
        assert_eq!(record.into_image().mirror(), Mirror::NotLogged);
    }

    #[test]
    fn test_commit_detaches_resident_blocks() {
        let fx = fixture(2);
        let mut log = UndoLog::open(&fx.log_path, &fx.dm, false).unwrap();
        let mut pool = BlockPool::new(4);

        let mut blk = modified(&fx, BlockId::new(0), b"committed");
        log.write_log_entry(BlockId::new(0), &mut blk, &fx.dm).unwrap();
        pool.insert(BlockAccessIndex::new(BlockId::new(0), blk));

        log.commit(&mut pool).unwrap();
        assert_eq!(log.num_entries(), 0);
        assert_eq!(log.logged_offset(BlockId::new(0)), None);
        assert_eq!(
            pool.get(BlockId::new(0)).unwrap().blk().mirror(),
            Mirror::NotLogged
        );
    }

    #[test]
    fn test_rollback_restores_pre_image() {
        let fx = fixture(1);
        let mut log = UndoLog::open(&fx.log_path, &fx.dm, false).unwrap();

        let mut blk = modified(&fx, BlockId::new(0), b"scribbled");
        log.write_log_entry(BlockId::new(0), &mut blk, &fx.dm).unwrap();
        fx.dm.write_block(BlockId::new(0), &blk).unwrap();

        let summary = log.rollback(&fx.dm).unwrap();
        assert_eq!(summary.entries, 1);

        let restored = fx.dm.read_block(BlockId::new(0)).unwrap();
        assert_eq!(&restored.data()[..10], b"original 0");
        assert_eq!(restored.mirror(), Mirror::NotLogged);
        assert_eq!(log.num_entries(), 0);
    }

    #[test]
    fn test_rollback_cache_invalidates_resident_copy() {
        let fx = fixture(1);
        let mut log = UndoLog::open(&fx.log_path, &fx.dm, false).unwrap();
        let mut pool = BlockPool::new(4);

        let mut blk = modified(&fx, BlockId::new(0), b"in memory");
        log.write_log_entry(BlockId::new(0), &mut blk, &fx.dm).unwrap();
        fx.dm.write_block(BlockId::new(0), &blk).unwrap();
        pool.insert(BlockAccessIndex::new(BlockId::new(0), blk));

        log.rollback_cache(&fx.dm, &mut pool).unwrap();

        let entry = pool.get(BlockId::new(0)).unwrap();
        assert!(entry.is_stale());
        assert!(!entry.is_dirty());
        assert_eq!(&entry.blk().data()[..10], b"original 0");
        assert_eq!(entry.blk().mirror(), Mirror::NotLogged);
    }

    #[test]
    fn test_update_key_count_and_reset() {
        let fx = fixture(0);
        let mut log = UndoLog::open(&fx.log_path, &fx.dm, false).unwrap();
        log.update_key_count(42).unwrap();
        drop(log);

        let mut log = UndoLog::open(&fx.log_path, &fx.dm, false).unwrap();
        assert_eq!(log.key_count(), 42);
        log.reset().unwrap();
        assert_eq!(log.key_count(), 0);
    }

    #[test]
    fn test_header_shorter_than_claimed_is_corrupt() {
        let fx = fixture(0);
        std::fs::write(&fx.log_path, [0u8; 5]).unwrap();
        let err = UndoLog::open(&fx.log_path, &fx.dm, false).err().unwrap();
        assert!(matches!(err, SackError::LogCorrupted(_)));
    }

    #[test]
    fn test_corrupt_record_fails_recovery() {
        let fx = fixture(1);
        {
            let mut log = UndoLog::open(&fx.log_path, &fx.dm, false).unwrap();
            let mut blk = fx.dm.read_block(BlockId::new(0)).unwrap();
            blk.set_mirror(Mirror::NotLogged);
            log.write_log_entry(BlockId::new(0), &mut blk, &fx.dm).unwrap();
        }

        // bytes_used of record 0
        let mut bytes = std::fs::read(&fx.log_path).unwrap();
        let at = LOG_HEADER_SIZE as usize + 16;
        bytes[at..at + 2].copy_from_slice(&[0xFF, 0xFF]);
        std::fs::write(&fx.log_path, &bytes).unwrap();

        let err = UndoLog::open(&fx.log_path, &fx.dm, false).err().unwrap();
        assert!(err.is_corruption());
        match err {
            SackError::LogCorrupted(msg) => assert!(msg.contains("offset 12"), "{}", msg),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_key_count_survives_commit_and_replay() {
        let fx = fixture(1);
        let mut pool = BlockPool::new(4);
        let mut log = UndoLog::open(&fx.log_path, &fx.dm, false).unwrap();
        log.commit_with_key_count(&mut pool, 6).unwrap();
        assert_eq!(log.key_count(), 6);

        let mut blk = fx.dm.read_block(BlockId::new(0)).unwrap();
        blk.set_mirror(Mirror::NotLogged);
        log.write_log_entry(BlockId::new(0), &mut blk, &fx.dm).unwrap();
        drop(log);

        let log = UndoLog::open(&fx.log_path, &fx.dm, false).unwrap();
        assert_eq!(log.recovery().map(|r| r.key_count), Some(6));
        assert_eq!(log.key_count(), 6);
    }
}
