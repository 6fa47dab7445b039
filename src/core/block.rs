//! Block types and their byte encoding
//!
//! Every block is exactly `block_size` bytes and starts with a one-byte tag.
//! Node blocks store their entry count right after the tag so decoding can
//! check bounds before touching variable-length content.
//!
//! ```text
//! IndexNode:  [1][count u16][child0 u64] count x [key][child u64]
//! LeafNode:   [2][count u16] count x [key][locator]
//!             locator = [0][len u16][bytes]  |  [1][len u64][head u64]
//! Free:       [3][next u64]
//! DataExtent: [4][next u64][len u16][payload]
//! ```

use crate::error::{PakError, Result};
use crate::header::{be_array, NO_BLOCK};
use crate::key::Key;

/// Index of a block inside the container (never a byte offset)
pub type BlockIndex = u64;

const NODE_HEADER: usize = 1 + 2;
const INDEX_HEADER: usize = NODE_HEADER + 8;
const EXTENT_HEADER: usize = 1 + 8 + 2;
const INLINE_OVERHEAD: usize = 1 + 2;
const EXTENT_LOCATOR_SIZE: usize = 1 + 8 + 8;

const LOCATOR_INLINE: u8 = 0;
const LOCATOR_EXTENT: u8 = 1;

/// Block tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockTag {
    IndexNode = 1,
    LeafNode = 2,
    Free = 3,
    DataExtent = 4,
}

impl BlockTag {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(BlockTag::IndexNode),
            2 => Ok(BlockTag::LeafNode),
            3 => Ok(BlockTag::Free),
            4 => Ok(BlockTag::DataExtent),
            _ => Err(PakError::corrupt(format!("invalid block tag {}", value))),
        }
    }
}

/// Block size and key width, plus the capacities derived from them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: u32,
    pub key_width: u16,
}

impl Geometry {
    /// Build a geometry, rejecting combinations that cannot hold a B-tree
    pub fn new(block_size: u32, key_width: u16) -> Result<Self> {
        let geometry = Geometry {
            block_size,
            key_width,
        };
        if geometry.leaf_capacity() < 3 || geometry.index_capacity() < 3 {
            return Err(PakError::Config(format!(
                "block size {} is too small for {}-byte keys",
                block_size, key_width
            )));
        }
        Ok(geometry)
    }

    pub fn block_len(&self) -> usize {
        self.block_size as usize
    }

    /// Largest value stored inline in a leaf
    pub fn inline_limit(&self) -> usize {
        (self.block_len() / 16)
            .saturating_sub(self.key_width as usize + INLINE_OVERHEAD)
            .max(EXTENT_LOCATOR_SIZE - INLINE_OVERHEAD)
    }

    /// Largest encoded leaf entry
    fn max_leaf_entry(&self) -> usize {
        self.key_width as usize + INLINE_OVERHEAD + self.inline_limit()
    }

    /// Maximum entries in a leaf
    pub fn leaf_capacity(&self) -> usize {
        (self.block_len() - NODE_HEADER) / self.max_leaf_entry()
    }

    /// Maximum keys in an index node (children = keys + 1)
    pub fn index_capacity(&self) -> usize {
        (self.block_len() - INDEX_HEADER) / (self.key_width as usize + 8)
    }

    pub fn leaf_min(&self) -> usize {
        self.leaf_capacity() / 2
    }

    pub fn index_min(&self) -> usize {
        self.index_capacity() / 2
    }

    /// Payload bytes per DataExtent block
    pub fn extent_payload(&self) -> usize {
        self.block_len() - EXTENT_HEADER
    }
}

/// Where a value's bytes live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueLocator {
    Inline(Vec<u8>),
    Extent { len: u64, head: BlockIndex },
}

impl ValueLocator {
    pub fn len(&self) -> u64 {
        match self {
            ValueLocator::Inline(bytes) => bytes.len() as u64,
            ValueLocator::Extent { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn encoded_len(&self) -> usize {
        match self {
            ValueLocator::Inline(bytes) => INLINE_OVERHEAD + bytes.len(),
            ValueLocator::Extent { .. } => EXTENT_LOCATOR_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeafNode {
    pub entries: Vec<(Key, ValueLocator)>,
}

impl LeafNode {
    pub fn search(&self, key: &Key) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.cmp(key))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexNode {
    /// Separator keys, strictly ascending
    pub keys: Vec<Key>,
    /// Child pointers; `children.len() == keys.len() + 1`
    pub children: Vec<BlockIndex>,
}

impl IndexNode {
    /// Child slot to descend into for `key` (keys equal to a separator go right)
    pub fn child_slot(&self, key: &Key) -> usize {
        self.keys.partition_point(|k| k <= key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataExtent {
    pub next: BlockIndex,
    pub data: Vec<u8>,
}

/// A decoded block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Index(IndexNode),
    Leaf(LeafNode),
    Free { next: BlockIndex },
    Extent(DataExtent),
}

impl Block {
    pub fn tag(&self) -> BlockTag {
        match self {
            Block::Index(_) => BlockTag::IndexNode,
            Block::Leaf(_) => BlockTag::LeafNode,
            Block::Free { .. } => BlockTag::Free,
            Block::Extent(_) => BlockTag::DataExtent,
        }
    }

    /// Encode into exactly one block of bytes
    pub fn encode(&self, geometry: &Geometry) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(geometry.block_len());
        out.push(self.tag() as u8);

        match self {
            Block::Index(node) => {
                if node.children.len() != node.keys.len() + 1 {
                    return Err(PakError::invariant(format!(
                        "index node with {} keys and {} children",
                        node.keys.len(),
                        node.children.len()
                    )));
                }
                if node.keys.len() > geometry.index_capacity() {
                    return Err(PakError::invariant(format!(
                        "index node holds {} keys (capacity {})",
                        node.keys.len(),
                        geometry.index_capacity()
                    )));
                }
                out.extend_from_slice(&(node.keys.len() as u16).to_be_bytes());
                out.extend_from_slice(&node.children[0].to_be_bytes());
                for (key, child) in node.keys.iter().zip(&node.children[1..]) {
                    check_key_width(key, geometry)?;
                    out.extend_from_slice(key.as_bytes());
                    out.extend_from_slice(&child.to_be_bytes());
                }
            }
            Block::Leaf(node) => {
                if node.entries.len() > geometry.leaf_capacity() {
                    return Err(PakError::invariant(format!(
                        "leaf holds {} entries (capacity {})",
                        node.entries.len(),
                        geometry.leaf_capacity()
                    )));
                }
                out.extend_from_slice(&(node.entries.len() as u16).to_be_bytes());
                for (key, locator) in &node.entries {
                    check_key_width(key, geometry)?;
                    out.extend_from_slice(key.as_bytes());
                    match locator {
                        ValueLocator::Inline(bytes) => {
                            if bytes.len() > geometry.inline_limit() {
                                return Err(PakError::invariant(format!(
                                    "inline value of {} bytes exceeds limit {}",
                                    bytes.len(),
                                    geometry.inline_limit()
                                )));
                            }
                            out.push(LOCATOR_INLINE);
                            out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                            out.extend_from_slice(bytes);
                        }
                        ValueLocator::Extent { len, head } => {
                            out.push(LOCATOR_EXTENT);
                            out.extend_from_slice(&len.to_be_bytes());
                            out.extend_from_slice(&head.to_be_bytes());
                        }
                    }
                }
            }
            Block::Free { next } => {
                out.extend_from_slice(&next.to_be_bytes());
            }
            Block::Extent(extent) => {
                if extent.data.len() > geometry.extent_payload() {
                    return Err(PakError::invariant(format!(
                        "extent payload of {} bytes exceeds {}",
                        extent.data.len(),
                        geometry.extent_payload()
                    )));
                }
                out.extend_from_slice(&extent.next.to_be_bytes());
                out.extend_from_slice(&(extent.data.len() as u16).to_be_bytes());
                out.extend_from_slice(&extent.data);
            }
        }

        debug_assert!(out.len() <= geometry.block_len());
        out.resize(geometry.block_len(), 0);
        Ok(out)
    }

    /// Decode one block, validating counts and ordering
    pub fn decode(bytes: &[u8], geometry: &Geometry) -> Result<Self> {
        if bytes.len() != geometry.block_len() {
            return Err(PakError::corrupt(format!(
                "block of {} bytes (expected {})",
                bytes.len(),
                geometry.block_len()
            )));
        }

        let mut reader = Reader { bytes, pos: 1 };
        match BlockTag::from_u8(bytes[0])? {
            BlockTag::IndexNode => {
                let count = reader.u16()? as usize;
                if count > geometry.index_capacity() {
                    return Err(PakError::corrupt(format!(
                        "index node claims {} keys (capacity {})",
                        count,
                        geometry.index_capacity()
                    )));
                }
                let mut keys = Vec::with_capacity(count);
                let mut children = Vec::with_capacity(count + 1);
                children.push(reader.u64()?);
                for _ in 0..count {
                    let key = Key::from_bytes(reader.take(geometry.key_width as usize)?, geometry.key_width)?;
                    if keys.last().is_some_and(|prev| prev >= &key) {
                        return Err(PakError::corrupt("index node keys out of order"));
                    }
                    keys.push(key);
                    children.push(reader.u64()?);
                }
                Ok(Block::Index(IndexNode { keys, children }))
            }
            BlockTag::LeafNode => {
                let count = reader.u16()? as usize;
                if count > geometry.leaf_capacity() {
                    return Err(PakError::corrupt(format!(
                        "leaf claims {} entries (capacity {})",
                        count,
                        geometry.leaf_capacity()
                    )));
                }
                let mut entries: Vec<(Key, ValueLocator)> = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = Key::from_bytes(reader.take(geometry.key_width as usize)?, geometry.key_width)?;
                    if entries.last().is_some_and(|(prev, _)| prev >= &key) {
                        return Err(PakError::corrupt("leaf keys out of order"));
                    }
                    let locator = match reader.u8()? {
                        LOCATOR_INLINE => {
                            let len = reader.u16()? as usize;
                            if len > geometry.inline_limit() {
                                return Err(PakError::corrupt(format!(
                                    "inline value of {} bytes exceeds limit",
                                    len
                                )));
                            }
                            ValueLocator::Inline(reader.take(len)?.to_vec())
                        }
                        LOCATOR_EXTENT => {
                            let len = reader.u64()?;
                            let head = reader.u64()?;
                            ValueLocator::Extent { len, head }
                        }
                        other => {
                            return Err(PakError::corrupt(format!(
                                "invalid value locator kind {}",
                                other
                            )))
                        }
                    };
                    entries.push((key, locator));
                }
                Ok(Block::Leaf(LeafNode { entries }))
            }
            BlockTag::Free => Ok(Block::Free {
                next: reader.u64()?,
            }),
            BlockTag::DataExtent => {
                let next = reader.u64()?;
                let len = reader.u16()? as usize;
                if len > geometry.extent_payload() {
                    return Err(PakError::corrupt(format!(
                        "extent claims {} payload bytes",
                        len
                    )));
                }
                Ok(Block::Extent(DataExtent {
                    next,
                    data: reader.take(len)?.to_vec(),
                }))
            }
        }
    }

    pub fn free(next: Option<BlockIndex>) -> Self {
        Block::Free {
            next: next.unwrap_or(NO_BLOCK),
        }
    }
}

fn check_key_width(key: &Key, geometry: &Geometry) -> Result<()> {
    if key.width() != geometry.key_width as usize {
        return Err(PakError::invariant(format!(
            "{}-byte key in a container with {}-byte keys",
            key.width(),
            geometry.key_width
        )));
    }
    Ok(())
}

/// Bounds-checked cursor over block bytes
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        if end > self.bytes.len() {
            return Err(PakError::corrupt("block content overruns block"));
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(be_array(self.take(2)?)))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(be_array(self.take(8)?)))
    }
}
