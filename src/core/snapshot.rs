//! Reader snapshots and deferred block release
//!
//! A reader pins the commit sequence it started at. Blocks superseded by a
//! commit stay allocated until every reader that could still reach them (any
//! reader pinned at an earlier sequence) has finished.

use crate::block::BlockIndex;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Committed state a reader sees
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPoint {
    pub root: BlockIndex,
    pub seq: u64,
}

/// Live reader counts per commit sequence
#[derive(Debug, Default)]
pub struct ReaderTracker {
    live: Mutex<BTreeMap<u64, usize>>,
}

impl ReaderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, seq: u64) {
        *self.live.lock().entry(seq).or_insert(0) += 1;
    }

    pub fn unregister(&self, seq: u64) {
        let mut live = self.live.lock();
        if let Some(count) = live.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                live.remove(&seq);
            }
        }
    }

    /// Oldest sequence any live reader is pinned at
    pub fn oldest(&self) -> Option<u64> {
        self.live.lock().keys().next().copied()
    }

    pub fn active(&self) -> usize {
        self.live.lock().values().sum()
    }
}

/// Blocks retired by one commit, waiting for older readers to finish
#[derive(Debug, Clone)]
struct Retired {
    /// Last sequence whose root could reach these blocks
    last_visible: u64,
    blocks: Vec<BlockIndex>,
}

/// Queue of retired blocks not yet safe to reuse
#[derive(Debug, Default)]
pub struct PendingRelease {
    queue: Vec<Retired>,
}

impl PendingRelease {
    /// Record blocks superseded by the commit that produced `seq`
    pub fn push(&mut self, seq: u64, blocks: Vec<BlockIndex>) {
        if blocks.is_empty() {
            return;
        }
        self.queue.push(Retired {
            last_visible: seq.saturating_sub(1),
            blocks,
        });
    }

    /// Take every block no live reader can reach
    pub fn drain_ready(&mut self, oldest_reader: Option<u64>) -> Vec<BlockIndex> {
        let mut ready = Vec::new();
        self.queue.retain_mut(|retired| {
            let reachable = oldest_reader.is_some_and(|oldest| oldest <= retired.last_visible);
            if reachable {
                true
            } else {
                ready.append(&mut retired.blocks);
                false
            }
        });
        ready
    }

    /// Blocks still waiting
    pub fn blocks(&self) -> impl Iterator<Item = BlockIndex> + '_ {
        self.queue.iter().flat_map(|retired| retired.blocks.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.queue.iter().map(|retired| retired.blocks.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
