use std::fmt;

use super::config::BLOCK_SIZE;

/// Logical block number - identifies a block slot in the main store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub i64);

/// Sentinel block number meaning "no block"
pub const INVALID_BLOCK_ID: BlockId = BlockId(-1);

impl BlockId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }

    /// Byte offset of this block's slot in the main store.
    pub fn file_offset(&self) -> u64 {
        self.0 as u64 * BLOCK_SIZE as u64
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.0)
    }
}

/// Undo state of a live block, stored in the header's mirror slot.
///
/// On disk this is `-1` for [`Mirror::NotLogged`], `0` for [`Mirror::Free`]
/// and the log byte offset for [`Mirror::LoggedAt`]. Undo log records reuse the
/// same slot for the original block number; see `UndoRecord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mirror {
    /// Not yet copied to the undo log this transaction.
    #[default]
    NotLogged,
    /// Newly allocated or free-chain block; never undo-logged.
    Free,
    /// Pre-image stored at this byte offset of the undo log.
    LoggedAt(u64),
}

impl Mirror {
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            0 => Mirror::Free,
            r if r > 0 => Mirror::LoggedAt(r as u64),
            _ => Mirror::NotLogged,
        }
    }

    pub fn to_raw(self) -> i64 {
        match self {
            Mirror::NotLogged => -1,
            Mirror::Free => 0,
            Mirror::LoggedAt(offset) => offset as i64,
        }
    }
}

/// Object pointer - block number plus byte offset within the block payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectPtr {
    pub block: BlockId,
    pub offset: u16,
}

impl ObjectPtr {
    /// The "no location" pointer.
    pub const EMPTY: ObjectPtr = ObjectPtr {
        block: INVALID_BLOCK_ID,
        offset: 0,
    };

    pub fn new(block: BlockId, offset: u16) -> Self {
        Self { block, offset }
    }

    /// Pointer to the start of a block.
    pub fn for_block(block: BlockId) -> Self {
        Self { block, offset: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.block == INVALID_BLOCK_ID
    }
}

impl fmt::Display for ObjectPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block.0, self.offset)
    }
}

/// Timestamp type for LRU tracking
pub type Timestamp = u64;
