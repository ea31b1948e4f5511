//! Block cache with LRU eviction and range invalidation.
//!
//! Maps a guest entry PC to its compiled [`JitBlock`]. One policy,
//! applied uniformly: a bounded LRU table keyed by entry PC, where each
//! block also carries its guest byte range so a write into already
//! compiled code can drop every covering block — required for
//! self-modifying guests.
//!
//! Invariants:
//! - at most one live block per entry PC; insertion overwrites,
//! - `clear()` must accompany any arena reset, since every cached block
//!   points into the old generation.

use super::block::JitBlock;
use lru::LruCache;
use std::collections::HashSet;
use std::num::NonZeroUsize;

/// Cache statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Lookup hits.
    pub hits: u64,
    /// Lookup misses.
    pub misses: u64,
    /// Blocks inserted.
    pub insertions: u64,
    /// Blocks evicted by LRU pressure.
    pub evictions: u64,
    /// Blocks dropped by invalidation or clear.
    pub invalidations: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct BlockCache {
    blocks: LruCache<u32, JitBlock>,
    /// Entry PCs that will never compile (window starts with an
    /// uncompilable instruction). Persists across `clear()`.
    blacklisted: HashSet<u32>,
    stats: CacheStats,
}

impl BlockCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            blocks: LruCache::new(
                NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::new(1).unwrap()),
            ),
            blacklisted: HashSet::new(),
            stats: CacheStats::default(),
        }
    }

    /// Look up a block (updates LRU order and the block's hit counter).
    pub fn get(&mut self, pc: u32) -> Option<&mut JitBlock> {
        match self.blocks.get_mut(&pc) {
            Some(block) => {
                self.stats.hits += 1;
                block.hits += 1;
                Some(block)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Peek without touching LRU order or counters.
    pub fn peek(&self, pc: u32) -> Option<&JitBlock> {
        self.blocks.peek(&pc)
    }

    pub fn contains(&self, pc: u32) -> bool {
        self.blocks.contains(&pc)
    }

    /// Insert a block, overwriting any stale block at that PC.
    pub fn insert(&mut self, pc: u32, block: JitBlock) {
        if let Some((evicted_pc, _)) = self.blocks.push(pc, block) {
            // push() returns the displaced entry: either the old block at
            // this PC (overwrite) or the LRU victim (capacity eviction).
            if evicted_pc == pc {
                self.stats.invalidations += 1;
            } else {
                self.stats.evictions += 1;
            }
        }
        self.stats.insertions += 1;
    }

    /// Drop the block at exactly this entry PC.
    pub fn invalidate(&mut self, pc: u32) -> bool {
        if self.blocks.pop(&pc).is_some() {
            self.stats.invalidations += 1;
            true
        } else {
            false
        }
    }

    /// Drop every block whose guest range covers a written address.
    pub fn invalidate_write(&mut self, addr: u32) -> usize {
        let stale: Vec<u32> = self
            .blocks
            .iter()
            .filter(|(_, block)| block.covers(addr))
            .map(|(pc, _)| *pc)
            .collect();

        for pc in &stale {
            self.blocks.pop(pc);
        }
        self.stats.invalidations += stale.len() as u64;
        if !stale.is_empty() {
            log::debug!(
                "write to {addr:#010x} invalidated {} compiled block(s)",
                stale.len()
            );
        }
        stale.len()
    }

    /// Drop all entries (arena reset, image reload). The blacklist
    /// persists: what could not compile before still cannot.
    pub fn clear(&mut self) {
        self.stats.invalidations += self.blocks.len() as u64;
        self.blocks.clear();
    }

    pub fn blacklist(&mut self, pc: u32) {
        self.blacklisted.insert(pc);
    }

    pub fn is_blacklisted(&self, pc: u32) -> bool {
        self.blacklisted.contains(&pc)
    }

    pub fn clear_blacklist(&mut self) {
        self.blacklisted.clear();
    }

    pub fn entry_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn capacity(&self) -> usize {
        self.blocks.cap().get()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_block(entry_pc: u32, len_words: u32) -> JitBlock {
        JitBlock::new(
            entry_pc,
            entry_pc + len_words * 4,
            std::ptr::null(),
            16,
            len_words,
            0,
        )
    }

    #[test]
    fn test_insert_get() {
        let mut cache = BlockCache::new(8);
        cache.insert(0x1000, make_block(0x1000, 4));

        assert!(cache.contains(0x1000));
        assert!(cache.get(0x1000).is_some());
        assert!(cache.get(0x2000).is_none());
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_get_bumps_block_hit_counter() {
        let mut cache = BlockCache::new(8);
        cache.insert(0x1000, make_block(0x1000, 4));

        cache.get(0x1000);
        cache.get(0x1000);

        assert_eq!(cache.peek(0x1000).unwrap().hits, 2);
    }

    #[test]
    fn test_insert_overwrites_same_pc() {
        let mut cache = BlockCache::new(8);
        cache.insert(0x1000, make_block(0x1000, 4));
        cache.insert(0x1000, make_block(0x1000, 8));

        assert_eq!(cache.entry_count(), 1);
        assert_eq!(cache.peek(0x1000).unwrap().instructions(), 8);
        assert_eq!(cache.stats().invalidations, 1);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = BlockCache::new(2);
        cache.insert(0x1000, make_block(0x1000, 1));
        cache.insert(0x2000, make_block(0x2000, 1));

        // Touch 0x1000 so 0x2000 becomes the LRU victim.
        cache.get(0x1000);
        cache.insert(0x3000, make_block(0x3000, 1));

        assert!(cache.contains(0x1000));
        assert!(!cache.contains(0x2000));
        assert!(cache.contains(0x3000));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_invalidate_write_drops_covering_blocks() {
        let mut cache = BlockCache::new(8);
        cache.insert(0x1000, make_block(0x1000, 4)); // 0x1000..0x1010
        cache.insert(0x1008, make_block(0x1008, 4)); // 0x1008..0x1018
        cache.insert(0x2000, make_block(0x2000, 4));

        let dropped = cache.invalidate_write(0x100C);

        assert_eq!(dropped, 2);
        assert!(!cache.contains(0x1000));
        assert!(!cache.contains(0x1008));
        assert!(cache.contains(0x2000));
    }

    #[test]
    fn test_invalidate_write_outside_any_range() {
        let mut cache = BlockCache::new(8);
        cache.insert(0x1000, make_block(0x1000, 4));
        assert_eq!(cache.invalidate_write(0x5000), 0);
        assert!(cache.contains(0x1000));
    }

    #[test]
    fn test_clear_keeps_blacklist() {
        let mut cache = BlockCache::new(8);
        cache.insert(0x1000, make_block(0x1000, 4));
        cache.blacklist(0x3000);

        cache.clear();

        assert_eq!(cache.entry_count(), 0);
        assert!(cache.is_blacklisted(0x3000));

        cache.clear_blacklist();
        assert!(!cache.is_blacklisted(0x3000));
    }
}
