//! Block store: allocation, the free list and cached block access
//!
//! The free list is kept in memory as a stack whose bottom `durable` entries
//! are known to match the chain on disk. Pushing never rewrites the durable
//! part; a commit writes Free blocks only for entries above it, each pointing
//! at the entry below, and the header then records the top of the stack.

use crate::block::{Block, BlockIndex, Geometry};
use crate::buffer_pool::{BlockCache, CacheStats};
use crate::catalog::NodeStore;
use crate::error::{PakError, Result};
use crate::header::{Header, NO_BLOCK};
use crate::io::ContainerFile;
use ahash::AHashSet;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
struct FreeList {
    /// Reusable blocks, top of the stack last
    stack: Vec<BlockIndex>,
    members: AHashSet<BlockIndex>,
    /// Entries `stack[..durable]` already form the on-disk chain
    durable: usize,
    block_count: u64,
}

/// Allocation state captured when a batch starts, restored on abort
#[derive(Debug, Clone)]
pub struct AllocMark {
    stack: Vec<BlockIndex>,
    block_count: u64,
}

pub struct BlockStore {
    file: ContainerFile,
    geometry: Geometry,
    cache: Mutex<BlockCache>,
    free: Mutex<FreeList>,
}

impl BlockStore {
    /// Wrap an open container file, loading the free chain from disk
    pub fn open(file: ContainerFile, header: &Header, cache_capacity: usize) -> Result<Self> {
        let geometry = Geometry::new(header.block_size, header.key_width)?;
        let store = BlockStore {
            file,
            geometry,
            cache: Mutex::new(BlockCache::new(cache_capacity)),
            free: Mutex::new(FreeList {
                block_count: header.block_count,
                ..FreeList::default()
            }),
        };
        store.load_free_chain(header.free_head)?;
        Ok(store)
    }

    fn load_free_chain(&self, head: BlockIndex) -> Result<()> {
        let mut chain = Vec::new();
        let mut seen = AHashSet::new();
        let block_count = self.block_count();
        let mut next = head;

        while next != NO_BLOCK {
            if next >= block_count || !seen.insert(next) {
                warn!(block = next, "free chain points outside the file or loops; truncating");
                break;
            }
            match self.read_uncached(next) {
                Ok(Block::Free { next: following }) => {
                    chain.push(next);
                    next = following;
                }
                Ok(other) => {
                    warn!(
                        block = next,
                        tag = ?other.tag(),
                        "free chain reaches a block that is in use; truncating"
                    );
                    break;
                }
                Err(e) => {
                    warn!(block = next, error = %e, "unreadable free chain block; truncating");
                    break;
                }
            }
        }

        // The chain runs top to bottom; the stack keeps the bottom first
        chain.reverse();
        let mut free = self.free.lock();
        free.members = chain.iter().copied().collect();
        free.durable = chain.len();
        free.stack = chain;
        debug!(free_blocks = free.stack.len(), "loaded free chain");
        Ok(())
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn file(&self) -> &ContainerFile {
        &self.file
    }

    /// Number of blocks in the container (committed plus staged growth)
    pub fn block_count(&self) -> u64 {
        self.free.lock().block_count
    }

    /// Pop the free-list head or extend the file by one block
    pub fn allocate(&self) -> Result<BlockIndex> {
        let mut free = self.free.lock();
        if let Some(index) = free.stack.pop() {
            free.members.remove(&index);
            free.durable = free.durable.min(free.stack.len());
            debug!(block = index, "allocated block from free list");
            return Ok(index);
        }
        let index = free.block_count;
        free.block_count += 1;
        debug!(block = index, "extended container by one block");
        Ok(index)
    }

    /// Push a block onto the free list
    pub fn free(&self, index: BlockIndex) -> Result<()> {
        {
            let mut free = self.free.lock();
            if index >= free.block_count || !free.members.insert(index) {
                return Err(PakError::InvalidBlock(index));
            }
            free.stack.push(index);
        }
        self.cache.lock().invalidate(index);
        Ok(())
    }

    pub fn is_free(&self, index: BlockIndex) -> bool {
        self.free.lock().members.contains(&index)
    }

    /// Snapshot of the free list, bottom first
    pub fn free_blocks(&self) -> Vec<BlockIndex> {
        self.free.lock().stack.clone()
    }

    /// Read and decode a block through the cache
    pub fn read(&self, index: BlockIndex) -> Result<Arc<Block>> {
        if let Some(block) = self.cache.lock().get(index) {
            return Ok(block);
        }
        if index >= self.block_count() {
            return Err(PakError::corrupt(format!(
                "block {} beyond container extent",
                index
            )));
        }
        let block = Arc::new(self.read_uncached(index)?);
        self.cache.lock().put_clean(index, Arc::clone(&block));
        Ok(block)
    }

    fn read_uncached(&self, index: BlockIndex) -> Result<Block> {
        let bytes = self.file.read_block(index)?;
        Block::decode(&bytes, &self.geometry)
    }

    /// Encode and write a block straight to disk
    pub fn write(&self, index: BlockIndex, block: &Block) -> Result<()> {
        if index >= self.block_count() {
            return Err(PakError::InvalidBlock(index));
        }
        let bytes = block.encode(&self.geometry)?;
        self.file.write_block(index, &bytes)
    }

    /// Hold a block in the cache until the batch commits
    pub fn stage(&self, index: BlockIndex, block: Block) {
        self.cache.lock().put_dirty(index, block);
    }

    pub fn is_staged(&self, index: BlockIndex) -> bool {
        self.cache.lock().is_dirty(index)
    }

    pub fn discard_staged(&self, index: BlockIndex) {
        self.cache.lock().discard_dirty(index);
    }

    /// Write every staged block to disk, returning how many were written
    pub fn flush_staged(&self) -> Result<usize> {
        let staged = self.cache.lock().dirty_blocks();
        for (index, block) in &staged {
            self.write(*index, block)?;
        }
        Ok(staged.len())
    }

    /// Write Free blocks for stack entries pushed since the last commit
    pub fn flush_free_list(&self) -> Result<usize> {
        let (stack, start) = {
            let free = self.free.lock();
            (free.stack.clone(), free.durable)
        };
        for position in start..stack.len() {
            let next = if position == 0 {
                NO_BLOCK
            } else {
                stack[position - 1]
            };
            self.write(stack[position], &Block::Free { next })?;
        }
        Ok(stack.len() - start)
    }

    /// Whether the free list or extent changed since the last commit
    pub fn has_unflushed_free_list(&self, committed: &Header) -> bool {
        let free = self.free.lock();
        free.durable != free.stack.len() || free.block_count != committed.block_count
    }

    /// Free-list head and block count to record in the next header
    pub fn commit_point(&self) -> (BlockIndex, u64) {
        let free = self.free.lock();
        (free.stack.last().copied().unwrap_or(NO_BLOCK), free.block_count)
    }

    /// Called once the header naming the current free list is on disk
    pub fn mark_durable(&self) {
        let mut free = self.free.lock();
        free.durable = free.stack.len();
        drop(free);
        self.cache.lock().promote_dirty();
    }

    pub fn mark(&self) -> AllocMark {
        let free = self.free.lock();
        AllocMark {
            stack: free.stack.clone(),
            block_count: free.block_count,
        }
    }

    /// Undo every allocation and release since `mark`, dropping staged blocks
    pub fn rollback(&self, mark: AllocMark) -> usize {
        let discarded = self.cache.lock().discard_all_dirty();
        let mut free = self.free.lock();
        // Entries popped during the batch may have been overwritten on disk,
        // so the durable prefix never grows back.
        let durable = free.durable.min(mark.stack.len());
        free.members = mark.stack.iter().copied().collect();
        free.stack = mark.stack;
        free.durable = durable;
        free.block_count = mark.block_count;
        discarded
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }
}

/// Committed view: reads go through the cache, nothing can be staged
impl NodeStore for BlockStore {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn load(&self, index: BlockIndex) -> Result<Arc<Block>> {
        self.read(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::LeafNode;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> BlockStore {
        let mut header = Header::new(512, 8);
        header.block_count = 1;
        let path = dir.path().join("store.pak");
        let file = ContainerFile::create(&path, &header).unwrap();
        file.write_block(
            0,
            &Block::Leaf(LeafNode::default())
                .encode(&Geometry::new(512, 8).unwrap())
                .unwrap(),
        )
        .unwrap();
        BlockStore::open(file, &header, 16).unwrap()
    }

    #[test]
    fn test_allocate_extends_then_reuses() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        assert_eq!(store.allocate().unwrap(), 1);
        assert_eq!(store.allocate().unwrap(), 2);
        store.free(1).unwrap();
        assert_eq!(store.allocate().unwrap(), 1);
        assert_eq!(store.allocate().unwrap(), 3);
        assert_eq!(store.block_count(), 4);
    }

    #[test]
    fn test_free_rejects_invalid_blocks() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        assert!(matches!(store.free(10), Err(PakError::InvalidBlock(10))));
        let index = store.allocate().unwrap();
        store.free(index).unwrap();
        assert!(matches!(store.free(index), Err(PakError::InvalidBlock(_))));
    }

    #[test]
    fn test_read_beyond_extent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(matches!(store.read(7), Err(PakError::CorruptFormat(_))));
    }

    #[test]
    fn test_staged_blocks_visible_before_flush() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let index = store.allocate().unwrap();
        store.stage(index, Block::Free { next: 0 });
        assert!(store.is_staged(index));
        assert_eq!(*store.read(index).unwrap(), Block::Free { next: 0 });

        assert_eq!(store.flush_staged().unwrap(), 1);
        store.mark_durable();
        assert!(!store.is_staged(index));
        assert_eq!(*store.read(index).unwrap(), Block::Free { next: 0 });
    }

    #[test]
    fn test_free_chain_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.pak");
        {
            let store = store(&dir);
            for _ in 0..4 {
                store.allocate().unwrap();
            }
            store.free(2).unwrap();
            store.free(4).unwrap();
            assert_eq!(store.flush_free_list().unwrap(), 2);

            let (free_head, block_count) = store.commit_point();
            assert_eq!(free_head, 4);
            let mut header = Header::new(512, 8);
            header.block_count = block_count;
            header.free_head = free_head;
            store.file().write_header(&header).unwrap();
            store.mark_durable();
            // Nothing new to write after the commit
            assert_eq!(store.flush_free_list().unwrap(), 0);
        }

        let (file, header) = ContainerFile::open(&path, true).unwrap();
        let store = BlockStore::open(file, &header, 16).unwrap();
        assert_eq!(store.free_blocks(), vec![2, 4]);
        assert_eq!(store.allocate().unwrap(), 4);
        assert_eq!(store.allocate().unwrap(), 2);
        assert_eq!(store.allocate().unwrap(), 5);
    }

    #[test]
    fn test_broken_chain_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.pak");
        {
            let store = store(&dir);
            for _ in 0..3 {
                store.allocate().unwrap();
            }
            store.free(1).unwrap();
            store.free(2).unwrap();
            store.flush_free_list().unwrap();
            // Block 1 is reused after the chain was written
            store
                .write(1, &Block::Leaf(LeafNode::default()))
                .unwrap();
            let mut header = Header::new(512, 8);
            header.block_count = 4;
            header.free_head = 2;
            store.file().write_header(&header).unwrap();
        }

        let (file, header) = ContainerFile::open(&path, true).unwrap();
        let store = BlockStore::open(file, &header, 16).unwrap();
        assert_eq!(store.free_blocks(), vec![2]);
    }

    #[test]
    fn test_rollback_restores_allocation_state() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let a = store.allocate().unwrap();
        store.free(a).unwrap();

        let mark = store.mark();
        let reused = store.allocate().unwrap();
        let fresh = store.allocate().unwrap();
        store.stage(reused, Block::Free { next: NO_BLOCK });
        store.stage(fresh, Block::Free { next: NO_BLOCK });

        assert_eq!(store.rollback(mark), 2);
        assert_eq!(store.free_blocks(), vec![a]);
        assert_eq!(store.block_count(), 2);
        assert!(!store.is_staged(fresh));
    }
}
