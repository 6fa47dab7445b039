//! Copy-on-write B+ tree over fixed-size blocks
//!
//! - Values live only in leaves; index nodes hold separators and children
//! - A key equal to a separator belongs to the right-hand child
//! - Every mutation rewrites the path from the touched leaf to the root into
//!   freshly allocated blocks; the blocks it replaces are retired, never
//!   modified, so the previously committed root stays readable
//! - Leaves split at the median and the right half's first key becomes the
//!   separator; index nodes promote their median key
//! - Underflow borrows from an adjacent sibling when it can spare an entry and
//!   merges with it otherwise; a root index left with one child collapses
//!
//! Recursion depth is bounded by [`MAX_HEIGHT`].

use super::cursor::Cursor;
use super::extent;
use super::{NodeStore, NodeStoreMut};
use crate::block::{Block, BlockIndex, Geometry, IndexNode, LeafNode, ValueLocator};
use crate::error::{PakError, Result};
use crate::key::Key;
use tracing::debug;

/// Deepest tree accepted when walking from the root
pub const MAX_HEIGHT: usize = 48;

/// Result of rewriting one subtree during an insert
enum Staged {
    One(BlockIndex),
    Split {
        left: BlockIndex,
        separator: Key,
        right: BlockIndex,
    },
}

/// Handle on a tree, identified by its root block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTree {
    root: BlockIndex,
}

impl BTree {
    pub fn new(root: BlockIndex) -> Self {
        BTree { root }
    }

    /// Stage an empty tree (a single empty leaf)
    pub fn create<S: NodeStoreMut>(store: &mut S) -> Result<Self> {
        let root = store.put(Block::Leaf(LeafNode::default()))?;
        Ok(BTree { root })
    }

    pub fn root(&self) -> BlockIndex {
        self.root
    }

    /// Find the locator stored under `key`
    pub fn lookup<S: NodeStore>(&self, store: &S, key: &Key) -> Result<ValueLocator> {
        let mut index = self.root;
        for _ in 0..MAX_HEIGHT {
            let block = store.load(index)?;
            match block.as_ref() {
                Block::Leaf(leaf) => {
                    return leaf
                        .search(key)
                        .map(|pos| leaf.entries[pos].1.clone())
                        .map_err(|_| PakError::NotFound(key.to_hex()));
                }
                Block::Index(node) => index = node.children[node.child_slot(key)],
                other => return Err(unexpected(index, other)),
            }
        }
        Err(too_deep())
    }

    /// Read a whole value
    pub fn get<S: NodeStore>(&self, store: &S, key: &Key) -> Result<Vec<u8>> {
        let locator = self.lookup(store, key)?;
        extent::read_value(store, &locator, 0, locator.len() as usize)
    }

    pub fn contains<S: NodeStore>(&self, store: &S, key: &Key) -> Result<bool> {
        match self.lookup(store, key) {
            Ok(_) => Ok(true),
            Err(PakError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Number of levels from the root to the leaves
    pub fn height<S: NodeStore>(&self, store: &S) -> Result<usize> {
        let mut index = self.root;
        for level in 1..=MAX_HEIGHT {
            let block = store.load(index)?;
            match block.as_ref() {
                Block::Leaf(_) => return Ok(level),
                Block::Index(node) => index = node.children[0],
                other => return Err(unexpected(index, other)),
            }
        }
        Err(too_deep())
    }

    /// Ordered scan of keys starting with `prefix`
    pub fn iter<'s, S: NodeStore>(&self, store: &'s S, prefix: &[u8]) -> Cursor<'s, S> {
        Cursor::new(store, self.root, prefix)
    }

    /// Insert or replace a value, returning the length of the value it replaced
    pub fn insert<S: NodeStoreMut>(
        &mut self,
        store: &mut S,
        key: Key,
        value: &[u8],
    ) -> Result<Option<u64>> {
        let geometry = store.geometry();
        check_width(&key, &geometry)?;

        let locator = if value.len() <= geometry.inline_limit() {
            ValueLocator::Inline(value.to_vec())
        } else {
            ValueLocator::Extent {
                len: value.len() as u64,
                head: extent::write_chain(store, value)?,
            }
        };

        let (staged, replaced) = insert_into(store, self.root, key, locator, 0)?;
        let root = match staged {
            Staged::One(index) => index,
            Staged::Split {
                left,
                separator,
                right,
            } => {
                debug!(left, right, "root split");
                store.put(Block::Index(IndexNode {
                    keys: vec![separator],
                    children: vec![left, right],
                }))?
            }
        };
        self.root = root;

        if let Some(old) = &replaced {
            release(store, old)?;
        }
        Ok(replaced.map(|old| old.len()))
    }

    /// Remove a key, returning the length of the removed value
    pub fn delete<S: NodeStoreMut>(&mut self, store: &mut S, key: &Key) -> Result<u64> {
        let (root_block, removed) = delete_from(store, self.root, key, 0)?
            .ok_or_else(|| PakError::NotFound(key.to_hex()))?;

        let old_root = self.root;
        self.root = match root_block {
            Block::Index(node) if node.keys.is_empty() => {
                debug!(old_root, new_root = node.children[0], "root collapse");
                node.children[0]
            }
            block => put_node(store, block, false)?,
        };
        store.retire(old_root)?;

        release(store, &removed)?;
        Ok(removed.len())
    }
}

fn insert_into<S: NodeStoreMut>(
    store: &mut S,
    index: BlockIndex,
    key: Key,
    locator: ValueLocator,
    depth: usize,
) -> Result<(Staged, Option<ValueLocator>)> {
    if depth >= MAX_HEIGHT {
        return Err(too_deep());
    }
    let geometry = store.geometry();
    let block = store.load(index)?;

    match block.as_ref() {
        Block::Leaf(leaf) => {
            let mut entries = leaf.entries.clone();
            let replaced = match leaf.search(&key) {
                Ok(pos) => Some(std::mem::replace(&mut entries[pos].1, locator)),
                Err(pos) => {
                    entries.insert(pos, (key, locator));
                    None
                }
            };
            store.retire(index)?;

            if entries.len() <= geometry.leaf_capacity() {
                let staged = put_node(store, Block::Leaf(LeafNode { entries }), depth > 0)?;
                return Ok((Staged::One(staged), replaced));
            }

            let right = entries.split_off(entries.len() / 2);
            let separator = right[0].0.clone();
            let left = put_node(store, Block::Leaf(LeafNode { entries }), true)?;
            let right = put_node(store, Block::Leaf(LeafNode { entries: right }), true)?;
            debug!(left, right, "leaf split");
            Ok((
                Staged::Split {
                    left,
                    separator,
                    right,
                },
                replaced,
            ))
        }
        Block::Index(node) => {
            let slot = node.child_slot(&key);
            let (child, replaced) = insert_into(store, node.children[slot], key, locator, depth + 1)?;

            let mut keys = node.keys.clone();
            let mut children = node.children.clone();
            match child {
                Staged::One(child) => children[slot] = child,
                Staged::Split {
                    left,
                    separator,
                    right,
                } => {
                    children[slot] = left;
                    keys.insert(slot, separator);
                    children.insert(slot + 1, right);
                }
            }
            store.retire(index)?;

            if keys.len() <= geometry.index_capacity() {
                let staged = put_node(store, Block::Index(IndexNode { keys, children }), depth > 0)?;
                return Ok((Staged::One(staged), replaced));
            }

            let mid = keys.len() / 2;
            let right_keys = keys.split_off(mid + 1);
            let separator = pop_last(&mut keys)?;
            let right_children = children.split_off(mid + 1);
            let left = put_node(store, Block::Index(IndexNode { keys, children }), true)?;
            let right = put_node(
                store,
                Block::Index(IndexNode {
                    keys: right_keys,
                    children: right_children,
                }),
                true,
            )?;
            debug!(left, right, "index split");
            Ok((
                Staged::Split {
                    left,
                    separator,
                    right,
                },
                replaced,
            ))
        }
        other => Err(unexpected(index, other)),
    }
}

/// Remove `key` below `index`, returning the node's new (unstaged) content
fn delete_from<S: NodeStoreMut>(
    store: &mut S,
    index: BlockIndex,
    key: &Key,
    depth: usize,
) -> Result<Option<(Block, ValueLocator)>> {
    if depth >= MAX_HEIGHT {
        return Err(too_deep());
    }
    let block = store.load(index)?;

    match block.as_ref() {
        Block::Leaf(leaf) => {
            let Ok(pos) = leaf.search(key) else {
                return Ok(None);
            };
            let mut entries = leaf.entries.clone();
            let (_, removed) = entries.remove(pos);
            Ok(Some((Block::Leaf(LeafNode { entries }), removed)))
        }
        Block::Index(node) => {
            let slot = node.child_slot(key);
            let child_index = node.children[slot];
            let Some((child, removed)) = delete_from(store, child_index, key, depth + 1)? else {
                return Ok(None);
            };
            store.retire(child_index)?;

            let mut parent = node.clone();
            if node_len(&child) >= min_len(&child, &store.geometry()) {
                parent.children[slot] = put_node(store, child, true)?;
            } else {
                rebalance(store, &mut parent, slot, child)?;
            }
            Ok(Some((Block::Index(parent), removed)))
        }
        other => Err(unexpected(index, other)),
    }
}

/// Fix an underfull child at `slot` by borrowing from or merging with a sibling
fn rebalance<S: NodeStoreMut>(
    store: &mut S,
    parent: &mut IndexNode,
    slot: usize,
    child: Block,
) -> Result<()> {
    if parent.keys.is_empty() {
        return Err(PakError::invariant("index node without separators"));
    }
    let geometry = store.geometry();

    if slot > 0 {
        let sibling_index = parent.children[slot - 1];
        let sibling = store.load(sibling_index)?;
        let separator = parent.keys[slot - 1].clone();

        match (sibling.as_ref(), child) {
            (Block::Leaf(left), Block::Leaf(mut child)) => {
                let mut left = left.entries.clone();
                if left.len() > geometry.leaf_min() {
                    let moved = pop_last(&mut left)?;
                    parent.keys[slot - 1] = moved.0.clone();
                    child.entries.insert(0, moved);
                    parent.children[slot - 1] = put_node(store, Block::Leaf(LeafNode { entries: left }), true)?;
                    parent.children[slot] = put_node(store, Block::Leaf(child), true)?;
                } else {
                    left.extend(child.entries);
                    parent.children[slot - 1] = put_node(store, Block::Leaf(LeafNode { entries: left }), true)?;
                    parent.keys.remove(slot - 1);
                    parent.children.remove(slot);
                }
            }
            (Block::Index(left), Block::Index(mut child)) => {
                let mut left = left.clone();
                if left.keys.len() > geometry.index_min() {
                    child.keys.insert(0, separator);
                    child.children.insert(0, pop_last(&mut left.children)?);
                    parent.keys[slot - 1] = pop_last(&mut left.keys)?;
                    parent.children[slot - 1] = put_node(store, Block::Index(left), true)?;
                    parent.children[slot] = put_node(store, Block::Index(child), true)?;
                } else {
                    left.keys.push(separator);
                    left.keys.extend(child.keys);
                    left.children.extend(child.children);
                    parent.children[slot - 1] = put_node(store, Block::Index(left), true)?;
                    parent.keys.remove(slot - 1);
                    parent.children.remove(slot);
                }
            }
            _ => return Err(PakError::invariant("siblings at different depths")),
        }
        store.retire(sibling_index)?;
    } else {
        let sibling_index = parent.children[slot + 1];
        let sibling = store.load(sibling_index)?;
        let separator = parent.keys[slot].clone();

        match (sibling.as_ref(), child) {
            (Block::Leaf(right), Block::Leaf(mut child)) => {
                let mut right = right.entries.clone();
                if right.len() > geometry.leaf_min() {
                    child.entries.push(right.remove(0));
                    parent.keys[slot] = right[0].0.clone();
                    parent.children[slot] = put_node(store, Block::Leaf(child), true)?;
                    parent.children[slot + 1] = put_node(store, Block::Leaf(LeafNode { entries: right }), true)?;
                } else {
                    child.entries.extend(right);
                    parent.children[slot] = put_node(store, Block::Leaf(child), true)?;
                    parent.keys.remove(slot);
                    parent.children.remove(slot + 1);
                }
            }
            (Block::Index(right), Block::Index(mut child)) => {
                let mut right = right.clone();
                if right.keys.len() > geometry.index_min() {
                    child.keys.push(separator);
                    child.children.push(right.children.remove(0));
                    parent.keys[slot] = right.keys.remove(0);
                    parent.children[slot] = put_node(store, Block::Index(child), true)?;
                    parent.children[slot + 1] = put_node(store, Block::Index(right), true)?;
                } else {
                    child.keys.push(separator);
                    child.keys.extend(right.keys);
                    child.children.extend(right.children);
                    parent.children[slot] = put_node(store, Block::Index(child), true)?;
                    parent.keys.remove(slot);
                    parent.children.remove(slot + 1);
                }
            }
            _ => return Err(PakError::invariant("siblings at different depths")),
        }
        store.retire(sibling_index)?;
    }

    Ok(())
}

/// Verify a freshly built node and stage it
fn put_node<S: NodeStoreMut>(store: &mut S, block: Block, require_min: bool) -> Result<BlockIndex> {
    verify_node(&block, &store.geometry(), require_min)?;
    store.put(block)
}

/// Local structural checks applied to every node a mutation produces
fn verify_node(block: &Block, geometry: &Geometry, require_min: bool) -> Result<()> {
    let len = node_len(block);
    let (capacity, min) = match block {
        Block::Leaf(leaf) => {
            if !leaf.entries.windows(2).all(|w| w[0].0 < w[1].0) {
                return Err(PakError::invariant("leaf keys not strictly ascending"));
            }
            (geometry.leaf_capacity(), geometry.leaf_min())
        }
        Block::Index(node) => {
            if node.children.len() != node.keys.len() + 1 {
                return Err(PakError::invariant(format!(
                    "index node with {} keys and {} children",
                    node.keys.len(),
                    node.children.len()
                )));
            }
            if node.keys.is_empty() {
                return Err(PakError::invariant("index node without separators"));
            }
            if !node.keys.windows(2).all(|w| w[0] < w[1]) {
                return Err(PakError::invariant("index keys not strictly ascending"));
            }
            (geometry.index_capacity(), geometry.index_min())
        }
        other => {
            return Err(PakError::invariant(format!(
                "{:?} block staged as a tree node",
                other.tag()
            )))
        }
    };

    if len > capacity {
        return Err(PakError::invariant(format!(
            "node holds {} entries (capacity {})",
            len, capacity
        )));
    }
    if require_min && len < min {
        return Err(PakError::invariant(format!(
            "node holds {} entries (minimum {})",
            len, min
        )));
    }
    Ok(())
}

fn node_len(block: &Block) -> usize {
    match block {
        Block::Leaf(leaf) => leaf.entries.len(),
        Block::Index(node) => node.keys.len(),
        _ => 0,
    }
}

fn min_len(block: &Block, geometry: &Geometry) -> usize {
    match block {
        Block::Index(_) => geometry.index_min(),
        _ => geometry.leaf_min(),
    }
}

fn release<S: NodeStoreMut>(store: &mut S, locator: &ValueLocator) -> Result<()> {
    if let ValueLocator::Extent { len, head } = locator {
        extent::release_chain(store, *head, *len)?;
    }
    Ok(())
}

fn pop_last<T>(items: &mut Vec<T>) -> Result<T> {
    items
        .pop()
        .ok_or_else(|| PakError::invariant("borrow from an empty node"))
}

fn check_width(key: &Key, geometry: &Geometry) -> Result<()> {
    if key.width() != geometry.key_width as usize {
        return Err(PakError::invariant(format!(
            "{}-byte key in a tree of {}-byte keys",
            key.width(),
            geometry.key_width
        )));
    }
    Ok(())
}

pub(crate) fn unexpected(index: BlockIndex, block: &Block) -> PakError {
    PakError::corrupt(format!(
        "block {} is {:?} where a tree node was expected",
        index,
        block.tag()
    ))
}

fn too_deep() -> PakError {
    PakError::corrupt(format!("tree deeper than {} levels", MAX_HEIGHT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::check::check_tree;
    use crate::catalog::mem::MemStore;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn key(n: u64) -> Key {
        Key::from_bytes(&n.to_be_bytes(), 8).unwrap()
    }

    fn value(n: u64) -> Vec<u8> {
        format!("value-{}", n).into_bytes()
    }

    fn tree(store: &mut MemStore) -> BTree {
        BTree::create(store).unwrap()
    }

    #[test]
    fn test_empty_tree() {
        let mut store = MemStore::new(256, 8);
        let tree = tree(&mut store);
        assert_eq!(tree.height(&store).unwrap(), 1);
        assert!(matches!(
            tree.lookup(&store, &key(1)),
            Err(PakError::NotFound(_))
        ));
    }

    #[test]
    fn test_insert_many_with_splits() {
        let mut store = MemStore::new(256, 8);
        let mut tree = tree(&mut store);

        for i in 0..500 {
            tree.insert(&mut store, key(i), &value(i)).unwrap();
        }
        for i in 0..500 {
            assert_eq!(tree.get(&store, &key(i)).unwrap(), value(i));
        }
        assert!(tree.height(&store).unwrap() > 2);

        let report = check_tree(&store, tree.root()).unwrap();
        assert_eq!(report.entries, 500);
        // Every superseded block was retired
        assert_eq!(report.blocks.len(), store.live());
    }

    #[test]
    fn test_insert_random_order() {
        let mut store = MemStore::new(256, 8);
        let mut tree = tree(&mut store);
        let mut keys: Vec<u64> = (0..1000).collect();
        keys.shuffle(&mut StdRng::seed_from_u64(7));

        for &k in &keys {
            tree.insert(&mut store, key(k), &value(k)).unwrap();
        }

        let scanned: Vec<Key> = tree
            .iter(&store, &[])
            .map(|entry| entry.unwrap().0)
            .collect();
        let expected: Vec<Key> = (0..1000).map(key).collect();
        assert_eq!(scanned, expected);
    }

    #[test]
    fn test_replace_releases_old_extent() {
        let mut store = MemStore::new(256, 8);
        let mut tree = tree(&mut store);

        let big = vec![9u8; 2000];
        assert_eq!(tree.insert(&mut store, key(1), &big).unwrap(), None);
        let with_extent = store.live();

        assert_eq!(tree.insert(&mut store, key(1), b"small").unwrap(), Some(2000));
        assert_eq!(tree.get(&store, &key(1)).unwrap(), b"small");
        assert!(store.live() < with_extent);
        assert_eq!(check_tree(&store, tree.root()).unwrap().blocks.len(), store.live());
    }

    #[test]
    fn test_delete_all_collapses_root() {
        let mut store = MemStore::new(256, 8);
        let mut tree = tree(&mut store);
        let mut keys: Vec<u64> = (0..600).collect();
        for &k in &keys {
            tree.insert(&mut store, key(k), &value(k)).unwrap();
        }

        keys.shuffle(&mut StdRng::seed_from_u64(11));
        for (n, &k) in keys.iter().enumerate() {
            assert_eq!(tree.delete(&mut store, &key(k)).unwrap(), value(k).len() as u64);
            assert!(matches!(
                tree.lookup(&store, &key(k)),
                Err(PakError::NotFound(_))
            ));
            if n % 50 == 0 {
                let report = check_tree(&store, tree.root()).unwrap();
                assert_eq!(report.entries, 600 - n - 1);
            }
        }

        assert_eq!(tree.height(&store).unwrap(), 1);
        assert_eq!(store.live(), 1);
    }

    #[test]
    fn test_delete_missing_key() {
        let mut store = MemStore::new(256, 8);
        let mut tree = tree(&mut store);
        tree.insert(&mut store, key(1), b"a").unwrap();
        let root = tree.root();

        assert!(matches!(
            tree.delete(&mut store, &key(2)),
            Err(PakError::NotFound(_))
        ));
        assert_eq!(tree.root(), root);
    }

    #[test]
    fn test_copy_on_write_keeps_old_root_readable() {
        let mut store = MemStore::new(256, 8);
        let mut tree = tree(&mut store);
        for i in 0..50 {
            tree.insert(&mut store, key(i), &value(i)).unwrap();
        }
        let before = tree.root();
        tree.insert(&mut store, key(1000), b"new").unwrap();

        assert_ne!(tree.root(), before);
        assert!(store.retired.contains(&before));
    }

    #[test]
    fn test_wrong_key_width_rejected() {
        let mut store = MemStore::new(256, 8);
        let mut tree = tree(&mut store);
        let short = Key::from_bytes(&[1, 2, 3, 4], 4).unwrap();
        assert!(matches!(
            tree.insert(&mut store, short, b"x"),
            Err(PakError::TreeInvariantViolation(_))
        ));
    }
}
