use std::collections::HashMap;

use crate::common::{BlockId, Timestamp};

/// Tracks recency for a single resident block
#[derive(Debug)]
struct AccessInfo {
    /// Logical time of the most recent access
    last_access: Timestamp,
    /// Whether this block may currently be evicted
    is_evictable: bool,
}

/// LRU replacement policy over resident blocks.
///
/// Evicts the evictable block whose most recent access is the oldest. Blocks
/// pinned by the session are marked non-evictable and are skipped.
#[derive(Debug, Default)]
pub struct LruReplacer {
    entries: HashMap<BlockId, AccessInfo>,
    current_timestamp: Timestamp,
    evictable_count: usize,
}

impl LruReplacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an access to the given block, registering it if unknown.
    /// New blocks start out non-evictable.
    pub fn record_access(&mut self, block: BlockId) {
        self.current_timestamp += 1;
        let now = self.current_timestamp;
        self.entries
            .entry(block)
            .and_modify(|info| info.last_access = now)
            .or_insert(AccessInfo {
                last_access: now,
                is_evictable: false,
            });
    }

    /// Sets whether a block may be evicted.
    pub fn set_evictable(&mut self, block: BlockId, evictable: bool) {
        if let Some(info) = self.entries.get_mut(&block) {
            if info.is_evictable != evictable {
                info.is_evictable = evictable;
                if evictable {
                    self.evictable_count += 1;
                } else {
                    self.evictable_count -= 1;
                }
            }
        }
    }

    /// Picks the least recently used evictable block and stops tracking it.
    pub fn evict(&mut self) -> Option<BlockId> {
        let victim = self
            .entries
            .iter()
            .filter(|(_, info)| info.is_evictable)
            .min_by_key(|(_, info)| info.last_access)
            .map(|(&block, _)| block)?;
        self.remove(victim);
        Some(victim)
    }

    /// Stops tracking a block.
    pub fn remove(&mut self, block: BlockId) {
        if let Some(info) = self.entries.remove(&block) {
            if info.is_evictable {
                self.evictable_count -= 1;
            }
        }
    }

    /// Returns the number of evictable blocks.
    pub fn size(&self) -> usize {
        self.evictable_count
    }
}
