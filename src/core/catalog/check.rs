//! Full structural validation of a tree

use super::btree::{unexpected, MAX_HEIGHT};
use super::extent;
use super::NodeStore;
use crate::block::{Block, BlockIndex, ValueLocator};
use crate::error::{PakError, Result};
use crate::key::Key;
use ahash::AHashSet;

/// What a successful check found
#[derive(Debug, Clone, Default)]
pub struct TreeReport {
    pub height: usize,
    pub entries: usize,
    pub index_nodes: usize,
    pub leaves: usize,
    pub extent_blocks: usize,
    /// Every block reachable from the root, extents included
    pub blocks: AHashSet<BlockIndex>,
}

struct Bounds<'k> {
    lower: Option<&'k Key>,
    upper: Option<&'k Key>,
}

impl Bounds<'_> {
    fn contains(&self, key: &Key) -> bool {
        self.lower.map_or(true, |lower| key >= lower) && self.upper.map_or(true, |upper| key < upper)
    }
}

/// Walk the whole tree and verify ordering, separator bounds, fill factors,
/// uniform leaf depth and that no block is referenced twice
pub fn check_tree<S: NodeStore>(store: &S, root: BlockIndex) -> Result<TreeReport> {
    let mut report = TreeReport::default();
    let mut leaf_depth = None;
    walk(
        store,
        root,
        Bounds {
            lower: None,
            upper: None,
        },
        0,
        &mut leaf_depth,
        &mut report,
    )?;
    report.height = leaf_depth.map_or(0, |depth| depth + 1);
    Ok(report)
}

fn walk<S: NodeStore>(
    store: &S,
    index: BlockIndex,
    bounds: Bounds<'_>,
    depth: usize,
    leaf_depth: &mut Option<usize>,
    report: &mut TreeReport,
) -> Result<()> {
    if depth >= MAX_HEIGHT {
        return Err(PakError::corrupt(format!("tree deeper than {} levels", MAX_HEIGHT)));
    }
    if !report.blocks.insert(index) {
        return Err(PakError::invariant(format!("block {} referenced twice", index)));
    }

    let geometry = store.geometry();
    let block = store.load(index)?;
    match block.as_ref() {
        Block::Leaf(leaf) => {
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(expected) if expected != depth => {
                    return Err(PakError::invariant(format!(
                        "leaf {} at depth {}, other leaves at depth {}",
                        index, depth, expected
                    )));
                }
                Some(_) => {}
            }
            if depth > 0 && leaf.entries.len() < geometry.leaf_min() {
                return Err(PakError::invariant(format!(
                    "leaf {} holds {} entries (minimum {})",
                    index,
                    leaf.entries.len(),
                    geometry.leaf_min()
                )));
            }
            if !leaf.entries.windows(2).all(|w| w[0].0 < w[1].0) {
                return Err(PakError::invariant(format!("leaf {} out of order", index)));
            }

            for (key, locator) in &leaf.entries {
                if !bounds.contains(key) {
                    return Err(PakError::invariant(format!(
                        "key {} in leaf {} lies outside its separators",
                        key, index
                    )));
                }
                if let ValueLocator::Extent { len, head } = locator {
                    for block in extent::chain_blocks(store, *head, *len)? {
                        if !report.blocks.insert(block) {
                            return Err(PakError::invariant(format!(
                                "extent block {} referenced twice",
                                block
                            )));
                        }
                        report.extent_blocks += 1;
                    }
                }
            }

            report.leaves += 1;
            report.entries += leaf.entries.len();
        }
        Block::Index(node) => {
            if node.keys.is_empty() || node.children.len() != node.keys.len() + 1 {
                return Err(PakError::invariant(format!(
                    "index {} has {} keys and {} children",
                    index,
                    node.keys.len(),
                    node.children.len()
                )));
            }
            if depth > 0 && node.keys.len() < geometry.index_min() {
                return Err(PakError::invariant(format!(
                    "index {} holds {} keys (minimum {})",
                    index,
                    node.keys.len(),
                    geometry.index_min()
                )));
            }
            if !node.keys.windows(2).all(|w| w[0] < w[1]) {
                return Err(PakError::invariant(format!("index {} out of order", index)));
            }
            if let Some(key) = node.keys.iter().find(|key| !bounds.contains(key)) {
                return Err(PakError::invariant(format!(
                    "separator {} in index {} lies outside its parent's range",
                    key, index
                )));
            }

            report.index_nodes += 1;
            for (slot, child) in node.children.iter().enumerate() {
                let child_bounds = Bounds {
                    lower: if slot == 0 {
                        bounds.lower
                    } else {
                        Some(&node.keys[slot - 1])
                    },
                    upper: node.keys.get(slot).or(bounds.upper),
                };
                walk(store, *child, child_bounds, depth + 1, leaf_depth, report)?;
            }
        }
        other => return Err(unexpected(index, other)),
    }
    Ok(())
}
