use std::fmt;

use bytes::{Buf, BufMut};

use crate::common::{BlockId, Mirror, Result, SackError, BLOCK_HEADER_SIZE, DATA_SIZE, INVALID_BLOCK_ID};

/// Datablock layout (big-endian):
///
/// | Field        | Offset | Size      |
/// |--------------|--------|-----------|
/// | prev_block   | 0      | 8         |
/// | next_block   | 8      | 8         |
/// | bytes_used   | 16     | 2         |
/// | bytes_in_use | 18     | 2         |
/// | writer_id    | 20     | 8         |
/// | mirror       | 28     | 8         |
/// | payload      | 36     | DATA_SIZE |
///
/// Blocks form doubly linked chains through prev/next. `bytes_used` is the
/// high-water mark of the payload and bounds what the "used" encodings move.
pub struct Datablock {
    prev_block: BlockId,
    next_block: BlockId,
    bytes_used: u16,
    bytes_in_use: u16,
    writer_id: i64,
    mirror: Mirror,
    data: Box<[u8; DATA_SIZE]>,
    /// Modified in memory since it was read or last written (not persisted)
    dirty: bool,
}

impl Datablock {
    /// Creates an empty, unlinked block that has not been undo-logged.
    pub fn new() -> Self {
        Self {
            prev_block: INVALID_BLOCK_ID,
            next_block: INVALID_BLOCK_ID,
            bytes_used: 0,
            bytes_in_use: 0,
            writer_id: 0,
            mirror: Mirror::NotLogged,
            data: Box::new([0u8; DATA_SIZE]),
            dirty: false,
        }
    }

    /// Creates an empty block freshly taken from the allocator or free chain.
    /// Such blocks carry no meaningful pre-image and are never undo-logged.
    pub fn free() -> Self {
        let mut blk = Self::new();
        blk.mirror = Mirror::Free;
        blk
    }

    pub fn prev_block(&self) -> BlockId {
        self.prev_block
    }

    pub fn set_prev_block(&mut self, block: BlockId) {
        self.prev_block = block;
    }

    pub fn next_block(&self) -> BlockId {
        self.next_block
    }

    pub fn set_next_block(&mut self, block: BlockId) {
        self.next_block = block;
    }

    pub fn bytes_used(&self) -> u16 {
        self.bytes_used
    }

    pub fn set_bytes_used(&mut self, bytes_used: u16) {
        self.bytes_used = bytes_used;
    }

    pub fn bytes_in_use(&self) -> u16 {
        self.bytes_in_use
    }

    pub fn set_bytes_in_use(&mut self, bytes_in_use: u16) {
        self.bytes_in_use = bytes_in_use;
    }

    pub fn writer_id(&self) -> i64 {
        self.writer_id
    }

    pub fn set_writer_id(&mut self, writer_id: i64) {
        self.writer_id = writer_id;
    }

    pub fn mirror(&self) -> Mirror {
        self.mirror
    }

    pub fn set_mirror(&mut self, mirror: Mirror) {
        self.mirror = mirror;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    /// Returns the payload.
    pub fn data(&self) -> &[u8] {
        &self.data[..]
    }

    /// Returns the payload for direct mutation. Callers own the byte counts
    /// and the dirty flag when going through this path.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// Room left after the high-water mark.
    pub fn remaining(&self) -> usize {
        DATA_SIZE - self.bytes_used as usize
    }

    /// Copies as much of `src` as fits at `offset`, advancing the high-water
    /// mark and in-use count and marking the block dirty. Returns bytes written.
    pub fn write_bytes_at(&mut self, offset: usize, src: &[u8]) -> usize {
        if offset >= DATA_SIZE {
            return 0;
        }
        let n = src.len().min(DATA_SIZE - offset);
        if n == 0 {
            return 0;
        }
        self.data[offset..offset + n].copy_from_slice(&src[..n]);

        let end = (offset + n) as u16;
        if end > self.bytes_used {
            let grown = end - self.bytes_used;
            self.bytes_used = end;
            self.bytes_in_use = self.bytes_in_use.saturating_add(grown).min(DATA_SIZE as u16);
        }
        self.dirty = true;
        n
    }

    /// Copies bytes below the high-water mark starting at `offset` into `dst`.
    /// Returns bytes read.
    pub fn read_bytes_at(&self, offset: usize, dst: &mut [u8]) -> usize {
        let used = self.bytes_used as usize;
        if offset >= used {
            return 0;
        }
        let n = dst.len().min(used - offset);
        dst[..n].copy_from_slice(&self.data[offset..offset + n]);
        n
    }

    /// Writes the header and the whole payload.
    pub fn write_full<B: BufMut>(&self, dst: &mut B) {
        self.put_header(dst, self.mirror.to_raw());
        dst.put_slice(&self.data[..]);
    }

    /// Writes the header and only the used part of the payload.
    pub fn write_used<B: BufMut>(&self, dst: &mut B) {
        self.put_header(dst, self.mirror.to_raw());
        dst.put_slice(&self.data[..self.bytes_used as usize]);
    }

    /// Reads a block written by [`Datablock::write_full`].
    pub fn read_full<B: Buf>(src: &mut B) -> Result<Self> {
        let (mut blk, raw) = Self::get_header(src)?;
        blk.mirror = Mirror::from_raw(raw);
        blk.check_bytes_used()?;
        blk.get_payload(src, DATA_SIZE)?;
        Ok(blk)
    }

    /// Reads a block written by [`Datablock::write_used`]. Payload bytes past
    /// `bytes_used` are left zeroed.
    pub fn read_used<B: Buf>(src: &mut B) -> Result<Self> {
        let (mut blk, raw) = Self::get_header(src)?;
        blk.mirror = Mirror::from_raw(raw);
        blk.check_bytes_used()?;
        let used = blk.bytes_used as usize;
        blk.get_payload(src, used)?;
        Ok(blk)
    }

    /// Fails unless the high-water mark fits in the payload.
    pub(crate) fn check_bytes_used(&self) -> Result<()> {
        if self.bytes_used as usize > DATA_SIZE {
            return Err(SackError::PageInconsistent {
                bytes_used: self.bytes_used,
                capacity: DATA_SIZE,
            });
        }
        Ok(())
    }

    /// Writes the header with an explicit value in the mirror slot. Undo log
    /// records put the original block number there.
    pub(crate) fn put_header<B: BufMut>(&self, dst: &mut B, mirror_slot: i64) {
        dst.put_i64(self.prev_block.as_i64());
        dst.put_i64(self.next_block.as_i64());
        dst.put_u16(self.bytes_used);
        dst.put_u16(self.bytes_in_use);
        dst.put_i64(self.writer_id);
        dst.put_i64(mirror_slot);
    }

    /// Reads a header, returning the block with an unset mirror and the raw
    /// mirror slot for the caller to interpret.
    pub(crate) fn get_header<B: Buf>(src: &mut B) -> Result<(Self, i64)> {
        if src.remaining() < BLOCK_HEADER_SIZE {
            return Err(SackError::ShortRead {
                expected: BLOCK_HEADER_SIZE,
                actual: src.remaining(),
            });
        }
        let mut blk = Self::new();
        blk.prev_block = BlockId::new(src.get_i64());
        blk.next_block = BlockId::new(src.get_i64());
        blk.bytes_used = src.get_u16();
        blk.bytes_in_use = src.get_u16();
        blk.writer_id = src.get_i64();
        let raw = src.get_i64();
        Ok((blk, raw))
    }

    pub(crate) fn get_payload<B: Buf>(&mut self, src: &mut B, len: usize) -> Result<()> {
        if src.remaining() < len {
            return Err(SackError::ShortRead {
                expected: len,
                actual: src.remaining(),
            });
        }
        src.copy_to_slice(&mut self.data[..len]);
        Ok(())
    }

    /// Deep copy of links, byte counts and the used payload. The copy starts
    /// out dirty and unlogged.
    ///
    /// A block under write must never be duplicated, the copy would silently
    /// diverge from it.
    pub fn try_clone(&self) -> Result<Self> {
        if self.writer_id != 0 {
            return Err(SackError::CloneUnderWrite(self.writer_id));
        }
        let mut blk = Self::new();
        blk.prev_block = self.prev_block;
        blk.next_block = self.next_block;
        blk.bytes_used = self.bytes_used;
        blk.bytes_in_use = self.bytes_in_use;
        let used = self.bytes_used as usize;
        blk.data[..used].copy_from_slice(&self.data[..used]);
        blk.dirty = true;
        Ok(blk)
    }

    /// Transfers the full state of this block, mirror and writer included,
    /// into `dst`.
    pub fn clone_into(&self, dst: &mut Datablock) {
        dst.prev_block = self.prev_block;
        dst.next_block = self.next_block;
        dst.bytes_used = self.bytes_used;
        dst.bytes_in_use = self.bytes_in_use;
        dst.writer_id = self.writer_id;
        dst.mirror = self.mirror;
        let used = self.bytes_used as usize;
        dst.data[..used].copy_from_slice(&self.data[..used]);
        dst.data[used..].fill(0);
        dst.dirty = true;
    }
}

impl Default for Datablock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Datablock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datablock")
            .field("prev_block", &self.prev_block)
            .field("next_block", &self.next_block)
            .field("bytes_used", &self.bytes_used)
            .field("bytes_in_use", &self.bytes_in_use)
            .field("writer_id", &self.writer_id)
            .field("mirror", &self.mirror)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl fmt::Display for Datablock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prev = {} next = {} bytes_used = {} bytes_in_use = {} writer_id = {} mirror = {} dirty = {}",
            self.prev_block.as_i64(),
            self.next_block.as_i64(),
            self.bytes_used,
            self.bytes_in_use,
            self.writer_id,
            self.mirror.to_raw(),
            self.dirty
        )
    }
}
