//! Lazy ordered iteration over a tree

use super::btree::{unexpected, MAX_HEIGHT};
use super::NodeStore;
use crate::block::{Block, BlockIndex, ValueLocator};
use crate::error::{PakError, Result};
use crate::key::Key;
use std::sync::Arc;

/// Ordered scan over the keys sharing a prefix
///
/// Blocks are loaded one at a time as the scan advances. The cursor can be
/// repositioned with [`Cursor::seek`] to restart from any key.
pub struct Cursor<'s, S: NodeStore> {
    store: &'s S,
    root: BlockIndex,
    prefix: Vec<u8>,
    /// Lower bound for the next positioning
    from: Vec<u8>,
    /// Path from the root; each entry holds the slot currently visited
    stack: Vec<(Arc<Block>, usize)>,
    positioned: bool,
    done: bool,
    last: Option<Key>,
}

impl<'s, S: NodeStore> Cursor<'s, S> {
    pub fn new(store: &'s S, root: BlockIndex, prefix: &[u8]) -> Self {
        Cursor {
            store,
            root,
            prefix: prefix.to_vec(),
            from: prefix.to_vec(),
            stack: Vec::new(),
            positioned: false,
            done: false,
            last: None,
        }
    }

    /// Restart the scan at the first key `>= from` (still limited to the prefix)
    pub fn seek(&mut self, from: &[u8]) {
        self.from = if from < self.prefix.as_slice() {
            self.prefix.clone()
        } else {
            from.to_vec()
        };
        self.stack.clear();
        self.positioned = false;
        self.done = false;
    }

    /// Last key returned, for resuming a scan later
    pub fn last_key(&self) -> Option<&Key> {
        self.last.as_ref()
    }

    fn position(&mut self) -> Result<()> {
        let mut index = self.root;
        loop {
            if self.stack.len() >= MAX_HEIGHT {
                return Err(PakError::corrupt("tree deeper than the cursor allows"));
            }
            let block = self.store.load(index)?;
            match block.as_ref() {
                Block::Leaf(leaf) => {
                    let from = self.from.as_slice();
                    let pos = leaf.entries.partition_point(|(k, _)| k.as_bytes() < from);
                    self.stack.push((block, pos));
                    return Ok(());
                }
                Block::Index(node) => {
                    let from = self.from.as_slice();
                    let slot = node.keys.partition_point(|k| k.as_bytes() <= from);
                    index = node.children[slot];
                    self.stack.push((block, slot));
                }
                other => return Err(unexpected(index, other)),
            }
        }
    }

    fn descend_leftmost(&mut self, mut index: BlockIndex) -> Result<()> {
        loop {
            if self.stack.len() >= MAX_HEIGHT {
                return Err(PakError::corrupt("tree deeper than the cursor allows"));
            }
            let block = self.store.load(index)?;
            let next = match block.as_ref() {
                Block::Leaf(_) => None,
                Block::Index(node) => Some(node.children[0]),
                other => return Err(unexpected(index, other)),
            };
            self.stack.push((block, 0));
            match next {
                Some(child) => index = child,
                None => return Ok(()),
            }
        }
    }

    fn advance(&mut self) -> Result<Option<(Key, ValueLocator)>> {
        if !self.positioned {
            self.positioned = true;
            self.position()?;
        }

        loop {
            let Some((block, pos)) = self.stack.last_mut() else {
                return Ok(None);
            };
            match block.as_ref() {
                Block::Leaf(leaf) => {
                    if let Some((key, locator)) = leaf.entries.get(*pos) {
                        *pos += 1;
                        if !key.starts_with(&self.prefix) {
                            return Ok(None);
                        }
                        return Ok(Some((key.clone(), locator.clone())));
                    }
                    self.stack.pop();
                }
                Block::Index(node) => {
                    *pos += 1;
                    match node.children.get(*pos).copied() {
                        Some(child) => self.descend_leftmost(child)?,
                        None => {
                            self.stack.pop();
                        }
                    }
                }
                _ => return Err(PakError::corrupt("cursor stack holds a non-node block")),
            }
        }
    }
}

impl<'s, S: NodeStore> Iterator for Cursor<'s, S> {
    type Item = Result<(Key, ValueLocator)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(entry)) => {
                self.last = Some(entry.0.clone());
                Some(Ok(entry))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::mem::MemStore;
    use crate::catalog::BTree;

    fn key(hi: u8, n: u32) -> Key {
        let mut bytes = vec![hi, 0, 0, 0];
        bytes.extend_from_slice(&n.to_be_bytes());
        Key::from_bytes(&bytes, 8).unwrap()
    }

    fn populated() -> (MemStore, BTree) {
        let mut store = MemStore::new(256, 8);
        let mut tree = BTree::create(&mut store).unwrap();
        for hi in [1u8, 2, 3] {
            for n in 0..100u32 {
                tree.insert(&mut store, key(hi, n), &[hi]).unwrap();
            }
        }
        (store, tree)
    }

    #[test]
    fn test_prefix_scan() {
        let (store, tree) = populated();
        let keys: Vec<Key> = tree
            .iter(&store, &[2])
            .map(|entry| entry.unwrap().0)
            .collect();
        assert_eq!(keys.len(), 100);
        assert_eq!(keys[0], key(2, 0));
        assert_eq!(keys[99], key(2, 99));
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_full_scan_and_missing_prefix() {
        let (store, tree) = populated();
        assert_eq!(tree.iter(&store, &[]).count(), 300);
        assert_eq!(tree.iter(&store, &[9]).count(), 0);
        assert_eq!(tree.iter(&store, &[0]).count(), 0);
    }

    #[test]
    fn test_restart_from_key() {
        let (store, tree) = populated();
        let mut cursor = tree.iter(&store, &[]);
        let first: Vec<Key> = cursor.by_ref().take(10).map(|e| e.unwrap().0).collect();
        assert_eq!(cursor.last_key(), Some(&key(1, 9)));
        assert_eq!(first.len(), 10);

        cursor.seek(key(3, 50).as_bytes());
        let rest: Vec<Key> = cursor.map(|e| e.unwrap().0).collect();
        assert_eq!(rest.len(), 50);
        assert_eq!(rest[0], key(3, 50));
    }

    #[test]
    fn test_seek_between_keys() {
        let (store, tree) = populated();
        let mut cursor = tree.iter(&store, &[1]);
        // Bound that sorts after every key with prefix 1
        cursor.seek(&[1, 0xff]);
        assert!(cursor.next().is_none());
    }
}
