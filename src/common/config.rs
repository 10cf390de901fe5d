/// Total size of a block record on disk, header included (4 KB)
pub const BLOCK_SIZE: usize = 4096;

/// Size of the fixed block header:
/// prev (8) + next (8) + bytes_used (2) + bytes_in_use (2) + writer_id (8) + mirror (8)
pub const BLOCK_HEADER_SIZE: usize = 36;

/// Payload capacity of a block
pub const DATA_SIZE: usize = BLOCK_SIZE - BLOCK_HEADER_SIZE;

/// Byte offset of the mirror slot inside an encoded block header
pub const MIRROR_FIELD_OFFSET: usize = 28;

/// Undo log header: entry count (i32) + persisted key count (i64)
pub const LOG_HEADER_SIZE: u64 = 12;

/// Byte offset of the key count inside the undo log header
pub const LOG_KEY_COUNT_OFFSET: u64 = 4;

/// Minimum room left in a block before a new node is placed in it
pub const NEW_NODE_SLACK: usize = 5;

/// Default buffer pool size (number of resident blocks)
pub const DEFAULT_POOL_SIZE: usize = 64;

/// Smallest pool a session runs with: linking a block into the middle of a
/// chain pins the current block, the new block and its successor
pub const MIN_POOL_SIZE: usize = 3;

/// Extension appended to the database path to name its undo log
pub const LOG_EXTENSION: &str = ".log";

/// Runtime knobs for opening a session.
#[derive(Debug, Clone)]
pub struct SackConfig {
    /// Maximum number of blocks resident in the buffer pool.
    pub pool_size: usize,
    /// Whether to fsync the undo log after every pre-image it records.
    pub sync_log: bool,
}

impl SackConfig {
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_sync_log(mut self, sync_log: bool) -> Self {
        self.sync_log = sync_log;
        self
    }
}

impl Default for SackConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            sync_log: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_constants() {
        assert_eq!(BLOCK_HEADER_SIZE, 8 + 8 + 2 + 2 + 8 + 8);
        assert_eq!(DATA_SIZE + BLOCK_HEADER_SIZE, BLOCK_SIZE);
        assert_eq!(MIRROR_FIELD_OFFSET + 8, BLOCK_HEADER_SIZE);
    }

    #[test]
    fn test_config_builders() {
        let config = SackConfig::default().with_pool_size(3).with_sync_log(false);
        assert_eq!(config.pool_size, 3);
        assert!(!config.sync_log);
    }
}
