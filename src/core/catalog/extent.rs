//! DataExtent chains for values too large to store inline

use super::{NodeStore, NodeStoreMut};
use crate::block::{Block, BlockIndex, DataExtent, ValueLocator};
use crate::error::{PakError, Result};
use crate::header::NO_BLOCK;

/// Store `data` as a chain of extents, returning the head block
pub fn write_chain<S: NodeStoreMut>(store: &mut S, data: &[u8]) -> Result<BlockIndex> {
    let payload = store.geometry().extent_payload();
    let chunks: Vec<&[u8]> = if data.is_empty() {
        vec![data]
    } else {
        data.chunks(payload).collect()
    };

    let indices = (0..chunks.len())
        .map(|_| store.allocate())
        .collect::<Result<Vec<_>>>()?;

    for (position, chunk) in chunks.iter().enumerate() {
        let next = indices.get(position + 1).copied().unwrap_or(NO_BLOCK);
        store.stage(
            indices[position],
            Block::Extent(DataExtent {
                next,
                data: chunk.to_vec(),
            }),
        )?;
    }

    Ok(indices[0])
}

/// Read `len` bytes starting at `offset` from a chain holding `total` bytes
///
/// Only the extents overlapping the range are decoded; the chain is followed
/// from the head because extents carry no back pointers.
pub fn read_range<S: NodeStore>(
    store: &S,
    head: BlockIndex,
    total: u64,
    offset: u64,
    len: usize,
) -> Result<Vec<u8>> {
    if offset >= total || len == 0 {
        return Ok(Vec::new());
    }
    let end = total.min(offset.saturating_add(len as u64));
    let mut out = Vec::with_capacity((end - offset) as usize);

    let mut position = 0u64;
    let mut current = head;
    let mut hops = 0u64;
    let max_hops = max_chain_len(store, total);

    while position < end {
        if current == NO_BLOCK {
            return Err(PakError::corrupt(format!(
                "extent chain ends after {} of {} bytes",
                position, total
            )));
        }
        hops += 1;
        if hops > max_hops {
            return Err(PakError::corrupt("extent chain longer than its value"));
        }

        let block = store.load(current)?;
        let extent = as_extent(&block, current)?;
        let chunk_end = position + extent.data.len() as u64;

        if chunk_end > offset {
            let from = offset.saturating_sub(position) as usize;
            let to = (end.min(chunk_end) - position) as usize;
            out.extend_from_slice(&extent.data[from..to]);
        }

        position = chunk_end;
        current = extent.next;
    }

    Ok(out)
}

/// Read a whole chain
pub fn read_all<S: NodeStore>(store: &S, head: BlockIndex, total: u64) -> Result<Vec<u8>> {
    read_range(store, head, total, 0, total as usize)
}

/// Read part of a value wherever its bytes live
pub fn read_value<S: NodeStore>(
    store: &S,
    locator: &ValueLocator,
    offset: u64,
    len: usize,
) -> Result<Vec<u8>> {
    match locator {
        ValueLocator::Inline(bytes) => {
            let start = (offset.min(bytes.len() as u64)) as usize;
            let end = start.saturating_add(len).min(bytes.len());
            Ok(bytes[start..end].to_vec())
        }
        ValueLocator::Extent { len: total, head } => read_range(store, *head, *total, offset, len),
    }
}

/// Block indices of a chain, head first
pub fn chain_blocks<S: NodeStore>(store: &S, head: BlockIndex, total: u64) -> Result<Vec<BlockIndex>> {
    let max_hops = max_chain_len(store, total);
    let mut blocks = Vec::new();
    let mut stored = 0u64;
    let mut current = head;

    while current != NO_BLOCK {
        if blocks.len() as u64 >= max_hops {
            return Err(PakError::corrupt("extent chain longer than its value"));
        }
        let block = store.load(current)?;
        let extent = as_extent(&block, current)?;
        stored += extent.data.len() as u64;
        blocks.push(current);
        current = extent.next;
    }

    if stored != total {
        return Err(PakError::corrupt(format!(
            "extent chain holds {} bytes, locator says {}",
            stored, total
        )));
    }
    Ok(blocks)
}

/// Retire every block of a chain
pub fn release_chain<S: NodeStoreMut>(store: &mut S, head: BlockIndex, total: u64) -> Result<usize> {
    let blocks = chain_blocks(store, head, total)?;
    for index in &blocks {
        store.retire(*index)?;
    }
    Ok(blocks.len())
}

fn max_chain_len<S: NodeStore>(store: &S, total: u64) -> u64 {
    let payload = store.geometry().extent_payload() as u64;
    total.div_ceil(payload).max(1)
}

fn as_extent(block: &Block, index: BlockIndex) -> Result<&DataExtent> {
    match block {
        Block::Extent(extent) => Ok(extent),
        other => Err(PakError::corrupt(format!(
            "block {} is {:?}, expected a data extent",
            index,
            other.tag()
        ))),
    }
}
