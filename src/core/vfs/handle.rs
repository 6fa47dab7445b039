//! Open-file state
//!
//! Writes are buffered per handle as a map of non-overlapping dirty regions
//! keyed by offset. A later write always wins where regions overlap. Nothing
//! reaches the container until the handle is flushed.

use crate::key::Key;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct OpenFile {
    /// Stable file id; survives renames of the file
    pub id: u64,
    pub key: Key,
    pub writable: bool,
    /// Logical size, including unflushed writes and truncation
    size: u64,
    /// Committed bytes still visible through this handle
    base_len: u64,
    /// Lowest size set by `truncate` since the handle was last clean
    base_limit: Option<u64>,
    dirty: BTreeMap<u64, Vec<u8>>,
    changed: bool,
    /// Write counter value of the last modification
    touched: u64,
}

impl OpenFile {
    pub fn new(id: u64, key: Key, writable: bool, committed_len: u64) -> Self {
        OpenFile {
            id,
            key,
            writable,
            size: committed_len,
            base_len: committed_len,
            base_limit: None,
            dirty: BTreeMap::new(),
            changed: false,
            touched: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn base_len(&self) -> u64 {
        self.base_len
    }

    pub fn is_dirty(&self) -> bool {
        self.changed
    }

    pub fn touched(&self) -> u64 {
        self.touched
    }

    /// Number of buffered regions
    pub fn region_count(&self) -> usize {
        self.dirty.len()
    }

    /// Buffer `data` at `offset`, merging with overlapping or adjacent regions
    pub fn write(&mut self, offset: u64, data: &[u8], stamp: u64) {
        if data.is_empty() {
            return;
        }
        let end = offset + data.len() as u64;

        let merged: Vec<(u64, Vec<u8>)> = self
            .dirty
            .range(..=end)
            .filter(|(start, bytes)| **start + bytes.len() as u64 >= offset)
            .map(|(start, bytes)| (*start, bytes.clone()))
            .collect();

        let start = merged.first().map_or(offset, |(s, _)| (*s).min(offset));
        let stop = merged
            .last()
            .map_or(end, |(s, bytes)| (s + bytes.len() as u64).max(end));

        let mut region = vec![0u8; (stop - start) as usize];
        for (region_start, bytes) in &merged {
            let at = (region_start - start) as usize;
            region[at..at + bytes.len()].copy_from_slice(bytes);
            self.dirty.remove(region_start);
        }
        let at = (offset - start) as usize;
        region[at..at + data.len()].copy_from_slice(data);
        self.dirty.insert(start, region);

        self.size = self.size.max(end);
        self.changed = true;
        self.touched = stamp;
    }

    /// Set the logical size, dropping buffered bytes past it
    pub fn truncate(&mut self, size: u64, stamp: u64) {
        self.dirty.retain(|start, _| *start < size);
        if let Some((start, bytes)) = self.dirty.iter_mut().next_back() {
            let keep = (size - *start) as usize;
            bytes.truncate(keep);
        }
        self.base_len = self.base_len.min(size);
        self.base_limit = Some(self.base_limit.map_or(size, |limit| limit.min(size)));
        self.size = size;
        self.changed = true;
        self.touched = stamp;
    }

    /// Copies of the buffered bytes inside `offset..end`, clipped to it
    pub fn regions_in(&self, offset: u64, end: u64) -> Vec<(u64, Vec<u8>)> {
        self.dirty
            .range(..end)
            .filter_map(|(start, bytes)| {
                let region_end = start + bytes.len() as u64;
                if region_end <= offset {
                    return None;
                }
                let from = (*start).max(offset);
                let to = region_end.min(end);
                let slice = &bytes[(from - start) as usize..(to - start) as usize];
                Some((from, slice.to_vec()))
            })
            .collect()
    }

    /// Forget buffered state once the full value has been committed
    pub fn mark_clean(&mut self) {
        self.dirty.clear();
        self.base_len = self.size;
        self.base_limit = None;
        self.changed = false;
    }

    /// Drop unflushed writes, back to the committed length
    pub fn discard(&mut self, committed_len: u64) {
        self.dirty.clear();
        self.size = committed_len;
        self.base_len = committed_len;
        self.base_limit = None;
        self.changed = false;
    }

    /// Move buffered writes onto a newer committed value of `committed_len`
    ///
    /// A truncation made through this handle still hides committed bytes
    /// past it; otherwise the logical size follows the new value.
    pub fn rebase(&mut self, committed_len: u64) {
        match self.base_limit {
            Some(limit) => self.base_len = committed_len.min(limit),
            None => {
                let buffered_end = self
                    .dirty
                    .iter()
                    .next_back()
                    .map_or(0, |(start, bytes)| start + bytes.len() as u64);
                self.base_len = committed_len;
                self.size = committed_len.max(buffered_end);
            }
        }
    }
}

/// Copy regions from [`OpenFile::regions_in`] over `buf`, which holds the
/// file range starting at `offset`
pub fn apply_regions(buf: &mut [u8], offset: u64, regions: &[(u64, Vec<u8>)]) {
    for (start, bytes) in regions {
        let at = (start - offset) as usize;
        buf[at..at + bytes.len()].copy_from_slice(bytes);
    }
}
