use thiserror::Error;

use super::types::BlockId;

/// Storage engine error types
#[derive(Error, Debug)]
pub enum SackError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Undo log corrupted, delete it to discard the in-flight transaction: {0}")]
    LogCorrupted(String),

    #[error("Block inconsistency: bytes_used {bytes_used} exceeds capacity {capacity}")]
    PageInconsistent { bytes_used: u16, capacity: usize },

    #[error("Block read size invalid: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("Block {block} is corrupt")]
    CorruptBlock {
        block: BlockId,
        #[source]
        source: Box<SackError>,
    },

    #[error("Attempt to clone block under write {0}")]
    CloneUnderWrite(i64),

    #[error("Sentinel block seek error")]
    SentinelSeek,

    #[error("Block {0} is beyond the end of the store")]
    BlockOutOfRange(BlockId),

    #[error("No current block")]
    NoCurrentBlock,

    #[error("Buffer pool is full, no unpinned blocks available")]
    BufferPoolFull,
}

impl SackError {
    /// Whether this error reports on-disk corruption rather than an I/O failure or misuse.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            SackError::LogCorrupted(_)
                | SackError::PageInconsistent { .. }
                | SackError::ShortRead { .. }
                | SackError::CorruptBlock { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SackError>;
