//! Keyed index over the block store
//!
//! The tree code never touches the container file directly. It reads blocks
//! through [`NodeStore`] and records structural changes through
//! [`NodeStoreMut`], which lets the session decide what a staged block is and
//! when a superseded one may be reused.

pub mod btree;
pub mod check;
pub mod cursor;
pub mod extent;

pub use btree::BTree;
pub use check::{check_tree, TreeReport};
pub use cursor::Cursor;

use crate::block::{Block, BlockIndex, Geometry};
use crate::error::Result;
use std::sync::Arc;

/// Read access to decoded blocks
pub trait NodeStore {
    fn geometry(&self) -> Geometry;

    fn load(&self, index: BlockIndex) -> Result<Arc<Block>>;
}

/// Write access used while a batch is being staged
pub trait NodeStoreMut: NodeStore {
    /// Reserve a block for new content
    fn allocate(&mut self) -> Result<BlockIndex>;

    /// Record the content of a block allocated in this batch
    fn stage(&mut self, index: BlockIndex, block: Block) -> Result<()>;

    /// Mark a block as no longer referenced by the new root
    fn retire(&mut self, index: BlockIndex) -> Result<()>;

    /// Allocate a block and stage `block` in it
    fn put(&mut self, block: Block) -> Result<BlockIndex> {
        let index = self.allocate()?;
        self.stage(index, block)?;
        Ok(index)
    }
}
