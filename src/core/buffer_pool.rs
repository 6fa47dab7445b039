//! Bounded block cache
//!
//! Clean blocks live in an LRU and may be evicted at any time. Dirty blocks
//! (staged by an uncommitted batch) are pinned in a separate map until the
//! batch commits or aborts, so the cache can never lose uncommitted state.

use crate::block::{Block, BlockIndex};
use ahash::AHashMap;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub clean: usize,
    pub dirty: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct BlockCache {
    clean: LruCache<BlockIndex, Arc<Block>>,
    dirty: AHashMap<BlockIndex, Arc<Block>>,
    hits: u64,
    misses: u64,
}

impl BlockCache {
    /// Create a cache holding up to `capacity` clean blocks
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        BlockCache {
            clean: LruCache::new(capacity),
            dirty: AHashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Look up a block, dirty entries first
    pub fn get(&mut self, index: BlockIndex) -> Option<Arc<Block>> {
        if let Some(block) = self.dirty.get(&index) {
            self.hits += 1;
            return Some(Arc::clone(block));
        }
        match self.clean.get(&index) {
            Some(block) => {
                self.hits += 1;
                Some(Arc::clone(block))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Cache a block read from disk
    pub fn put_clean(&mut self, index: BlockIndex, block: Arc<Block>) {
        if !self.dirty.contains_key(&index) {
            self.clean.put(index, block);
        }
    }

    /// Pin a staged block until commit or abort
    pub fn put_dirty(&mut self, index: BlockIndex, block: Block) {
        self.clean.pop(&index);
        self.dirty.insert(index, Arc::new(block));
    }

    pub fn is_dirty(&self, index: BlockIndex) -> bool {
        self.dirty.contains_key(&index)
    }

    /// Dirty blocks in ascending index order
    pub fn dirty_blocks(&self) -> Vec<(BlockIndex, Arc<Block>)> {
        let mut blocks: Vec<_> = self
            .dirty
            .iter()
            .map(|(index, block)| (*index, Arc::clone(block)))
            .collect();
        blocks.sort_by_key(|(index, _)| *index);
        blocks
    }

    /// After a commit: every dirty block becomes an ordinary clean entry
    pub fn promote_dirty(&mut self) {
        for (index, block) in self.dirty.drain() {
            self.clean.put(index, block);
        }
    }

    /// Drop one dirty block (its index was released inside the batch)
    pub fn discard_dirty(&mut self, index: BlockIndex) {
        self.dirty.remove(&index);
    }

    /// After an abort: forget every staged block
    pub fn discard_all_dirty(&mut self) -> usize {
        let count = self.dirty.len();
        self.dirty.clear();
        count
    }

    /// Forget any cached copy of a block
    pub fn invalidate(&mut self, index: BlockIndex) {
        self.clean.pop(&index);
        self.dirty.remove(&index);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            clean: self.clean.len(),
            dirty: self.dirty.len(),
            capacity: self.clean.cap().get(),
        }
    }
}
