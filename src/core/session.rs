//! Container session: the transactional boundary around one open container
//!
//! One writer, many readers. Writers stage batches under the writer lock;
//! readers take [`Snapshot`]s of the last committed root and never see staged
//! blocks. A commit is:
//!
//! 1. write every staged block and the new free-list entries (all of them are
//!    unreachable from the committed root, so order does not matter)
//! 2. sync, write the header sector naming the new root, sync again
//! 3. queue the blocks the batch superseded until no snapshot can reach them
//!
//! Until the header write in step 2 completes the previous root is intact on
//! disk; a failure before it rolls the allocation state back to the batch
//! start. Once the header is written the commit stands, even if the final
//! sync fails.

use crate::block::{Block, BlockIndex, Geometry, LeafNode, ValueLocator};
use crate::buffer_pool::CacheStats;
use crate::catalog::{check_tree, extent, BTree, Cursor, NodeStore, NodeStoreMut};
use crate::config::PakConfig;
use crate::error::{PakError, Result};
use crate::header::Header;
use crate::io::ContainerFile;
use crate::key::Key;
use crate::snapshot::{CommitPoint, PendingRelease, ReaderTracker};
use crate::store::{AllocMark, BlockStore};
use ahash::AHashSet;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// One mutation in a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or replace
    Insert(Key, Vec<u8>),
    /// Remove; a missing key fails the whole batch with `NotFound`
    Delete(Key),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommitResult {
    pub seq: u64,
    pub root: BlockIndex,
    /// Staged blocks written by this commit
    pub written: usize,
    /// Blocks superseded by this commit
    pub retired: usize,
    /// False when the header was written but the sync after it failed
    pub durable: bool,
}

/// Block accounting produced by [`ContainerSession::check`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub commit_seq: u64,
    pub block_count: u64,
    pub height: usize,
    pub entries: usize,
    pub reachable: usize,
    pub free: usize,
    /// Superseded blocks still visible to a live snapshot
    pub pending: usize,
    /// Blocks neither reachable, free nor pending
    pub leaked: Vec<BlockIndex>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.leaked.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ContainerStats {
    pub block_size: u32,
    pub key_width: u16,
    pub block_count: u64,
    pub free_blocks: usize,
    pub pending_blocks: usize,
    pub commit_seq: u64,
    pub readers: usize,
    pub read_only: bool,
    #[serde(skip)]
    pub cache: CacheStats,
}

/// The batch currently being staged
struct Staging {
    tree: BTree,
    mark: AllocMark,
    /// Blocks allocated by this batch
    allocated: AHashSet<BlockIndex>,
    /// Committed blocks this batch no longer references
    retired: Vec<BlockIndex>,
}

struct WriterState {
    header: Header,
    staging: Option<Staging>,
    pending: PendingRelease,
}

/// Node store seen by the tree while a batch is staged
struct StagingStore<'a> {
    store: &'a BlockStore,
    staging: &'a mut Staging,
}

impl NodeStore for StagingStore<'_> {
    fn geometry(&self) -> Geometry {
        *self.store.geometry()
    }

    fn load(&self, index: BlockIndex) -> Result<Arc<Block>> {
        self.store.read(index)
    }
}

impl NodeStoreMut for StagingStore<'_> {
    fn allocate(&mut self) -> Result<BlockIndex> {
        let index = self.store.allocate()?;
        self.staging.allocated.insert(index);
        Ok(index)
    }

    fn stage(&mut self, index: BlockIndex, block: Block) -> Result<()> {
        if !self.staging.allocated.contains(&index) {
            return Err(PakError::invariant(format!(
                "block {} staged without being allocated by the batch",
                index
            )));
        }
        self.store.stage(index, block);
        Ok(())
    }

    fn retire(&mut self, index: BlockIndex) -> Result<()> {
        if self.staging.allocated.remove(&index) {
            // Never visible to a reader: reusable right away
            self.store.discard_staged(index);
            self.store.free(index)
        } else {
            self.staging.retired.push(index);
            Ok(())
        }
    }
}

pub struct ContainerSession {
    store: BlockStore,
    config: PakConfig,
    read_only: bool,
    writer: Mutex<WriterState>,
    committed: RwLock<CommitPoint>,
    readers: ReaderTracker,
}

impl ContainerSession {
    /// Create a new, empty container (overwrites an existing file)
    pub fn create<P: AsRef<Path>>(path: P, config: PakConfig) -> Result<Self> {
        config.check()?;
        if config.read_only {
            return Err(PakError::ReadOnly);
        }
        let geometry = config.geometry()?;

        let mut header = Header::new(config.block_size, config.key_width);
        header.block_count = 1;
        let file = ContainerFile::create(&path, &header)?;
        file.write_block(0, &Block::Leaf(LeafNode::default()).encode(&geometry)?)?;
        file.sync()?;

        let store = BlockStore::open(file, &header, config.cache_capacity)?;
        info!(
            path = %path.as_ref().display(),
            block_size = config.block_size,
            key_width = config.key_width,
            "created container"
        );
        Ok(Self::from_parts(store, header, config, false))
    }

    /// Open an existing container
    ///
    /// Only the header and the root block are validated here; use
    /// [`check`](Self::check) for a full structural check.
    pub fn open<P: AsRef<Path>>(path: P, config: PakConfig) -> Result<Self> {
        config.check()?;
        let path = path.as_ref();
        let (file, header) = ContainerFile::open(path, false)?;

        let mut read_only = config.read_only;
        if header.is_newer_minor() && !read_only {
            warn!(
                major = header.version_major,
                minor = header.version_minor,
                "container written by a newer format revision; opening read-only"
            );
            read_only = true;
        }
        let file = if read_only {
            file
        } else {
            ContainerFile::open(path, true)?.0
        };

        let store = BlockStore::open(file, &header, config.cache_capacity)?;
        match store.read(header.root_block)?.as_ref() {
            Block::Leaf(_) | Block::Index(_) => {}
            other => {
                return Err(PakError::corrupt(format!(
                    "root block {} is {:?}",
                    header.root_block,
                    other.tag()
                )))
            }
        }

        info!(
            path = %path.display(),
            root = header.root_block,
            blocks = header.block_count,
            seq = header.commit_seq,
            read_only,
            "opened container"
        );
        Ok(Self::from_parts(store, header, config, read_only))
    }

    fn from_parts(store: BlockStore, header: Header, config: PakConfig, read_only: bool) -> Self {
        ContainerSession {
            store,
            config,
            read_only,
            committed: RwLock::new(CommitPoint {
                root: header.root_block,
                seq: header.commit_seq,
            }),
            writer: Mutex::new(WriterState {
                header,
                staging: None,
                pending: PendingRelease::default(),
            }),
            readers: ReaderTracker::new(),
        }
    }

    pub fn config(&self) -> &PakConfig {
        &self.config
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn geometry(&self) -> Geometry {
        *self.store.geometry()
    }

    pub fn key_width(&self) -> u16 {
        self.store.geometry().key_width
    }

    pub fn path(&self) -> &Path {
        self.store.file().path()
    }

    /// Last committed root and sequence
    pub fn commit_point(&self) -> CommitPoint {
        *self.committed.read()
    }

    /// Pin the committed state for reading
    pub fn snapshot(&self) -> Snapshot<'_> {
        let committed = self.committed.read();
        self.readers.register(committed.seq);
        Snapshot {
            session: self,
            point: *committed,
        }
    }

    /// Read a whole committed value
    pub fn get(&self, key: &Key) -> Result<Vec<u8>> {
        self.snapshot().get(key)
    }

    pub fn contains(&self, key: &Key) -> Result<bool> {
        self.snapshot().contains(key)
    }

    /// Stage mutations without committing them
    ///
    /// Any failure discards the whole staged batch.
    pub fn stage(&self, ops: Vec<BatchOp>) -> Result<()> {
        self.ensure_writable()?;
        let mut writer = self.writer.lock();
        self.stage_locked(&mut writer, ops)
    }

    /// Commit the staged batch (or pending free-list changes)
    pub fn commit(&self) -> Result<CommitResult> {
        self.ensure_writable()?;
        let mut writer = self.writer.lock();
        self.commit_locked(&mut writer)
    }

    /// Discard the staged batch, returning how many staged blocks were dropped
    pub fn abort(&self) -> Result<usize> {
        self.ensure_writable()?;
        let mut writer = self.writer.lock();
        Ok(self.rollback(&mut writer))
    }

    /// Stage and commit a batch atomically
    pub fn apply(&self, ops: Vec<BatchOp>) -> Result<CommitResult> {
        self.apply_until(ops, None)
    }

    /// Like [`apply`](Self::apply), but aborts with `TimedOut` if `deadline`
    /// passes before the commit starts
    pub fn apply_until(&self, ops: Vec<BatchOp>, deadline: Option<Instant>) -> Result<CommitResult> {
        self.ensure_writable()?;
        let mut writer = self.writer.lock();
        self.stage_locked(&mut writer, ops)?;

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            let dropped = self.rollback(&mut writer);
            warn!(dropped, "request deadline passed before commit; batch aborted");
            return Err(PakError::TimedOut);
        }
        self.commit_locked(&mut writer)
    }

    fn stage_locked(&self, writer: &mut WriterState, ops: Vec<BatchOp>) -> Result<()> {
        if writer.staging.is_none() {
            self.release_ready(writer)?;
            writer.staging = Some(Staging {
                tree: BTree::new(writer.header.root_block),
                mark: self.store.mark(),
                allocated: AHashSet::new(),
                retired: Vec::new(),
            });
        }

        let result = match writer.staging.as_mut() {
            Some(staging) => {
                let mut tree = staging.tree;
                let mut nodes = StagingStore {
                    store: &self.store,
                    staging,
                };
                let result = ops.into_iter().try_for_each(|op| match op {
                    BatchOp::Insert(key, value) => tree.insert(&mut nodes, key, &value).map(|_| ()),
                    BatchOp::Delete(key) => tree.delete(&mut nodes, &key).map(|_| ()),
                });
                nodes.staging.tree = tree;
                result
            }
            None => Err(PakError::invariant("no batch staged")),
        };

        if let Err(e) = result {
            let dropped = self.rollback(writer);
            debug!(error = %e, dropped, "staging failed; batch discarded");
            return Err(e);
        }
        Ok(())
    }

    fn commit_locked(&self, writer: &mut WriterState) -> Result<CommitResult> {
        let staging = writer.staging.take();
        let root = staging
            .as_ref()
            .map_or(writer.header.root_block, |staging| staging.tree.root());

        if staging.is_none() && !self.store.has_unflushed_free_list(&writer.header) {
            return Ok(CommitResult {
                seq: writer.header.commit_seq,
                root,
                written: 0,
                retired: 0,
                durable: true,
            });
        }

        let (header, written, durable) = match self.persist(&writer.header, root) {
            Ok(done) => done,
            Err(e) => {
                if let Some(staging) = staging {
                    self.store.rollback(staging.mark);
                }
                warn!(error = %e, "commit failed; previous root kept");
                return Err(e);
            }
        };

        self.store.mark_durable();
        writer.header = header;
        *self.committed.write() = CommitPoint {
            root,
            seq: header.commit_seq,
        };

        let retired = staging.map(|staging| staging.retired).unwrap_or_default();
        let result = CommitResult {
            seq: header.commit_seq,
            root,
            written,
            retired: retired.len(),
            durable,
        };
        writer.pending.push(header.commit_seq, retired);
        if let Err(e) = self.release_ready(writer) {
            warn!(error = %e, "releasing superseded blocks failed");
        }

        info!(
            seq = result.seq,
            root = result.root,
            written = result.written,
            retired = result.retired,
            "commit"
        );
        Ok(result)
    }

    /// Write staged blocks, free-list entries and finally the header
    ///
    /// Errors up to and including the header write leave the previous root
    /// in effect. A failed sync after the header write does not: the new
    /// header may already be on disk, so the commit is reported as not durable.
    fn persist(&self, current: &Header, root: BlockIndex) -> Result<(Header, usize, bool)> {
        let written = retry_once("flush staged blocks", || self.store.flush_staged())?;
        retry_once("flush free list", || self.store.flush_free_list())?;
        retry_once("sync blocks", || self.store.sync())?;

        let (free_head, block_count) = self.store.commit_point();
        let mut header = *current;
        header.root_block = root;
        header.free_head = free_head;
        header.block_count = block_count;
        header.commit_seq += 1;

        retry_once("write header", || self.store.file().write_header(&header))?;
        let durable = match retry_once("sync header", || self.store.sync()) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    seq = header.commit_seq,
                    error = %e,
                    "header written but not synced; commit kept, durability unknown"
                );
                false
            }
        };
        Ok((header, written, durable))
    }

    fn rollback(&self, writer: &mut WriterState) -> usize {
        match writer.staging.take() {
            Some(staging) => {
                let dropped = self.store.rollback(staging.mark);
                debug!(dropped, "staged batch discarded");
                dropped
            }
            None => 0,
        }
    }

    /// Return superseded blocks no snapshot can reach to the free list
    fn release_ready(&self, writer: &mut WriterState) -> Result<()> {
        let ready = writer.pending.drain_ready(self.readers.oldest());
        if ready.is_empty() {
            return Ok(());
        }
        debug!(blocks = ready.len(), "releasing superseded blocks");
        for index in ready {
            self.store.free(index)?;
        }
        Ok(())
    }

    /// Full structural check plus block accounting
    pub fn check(&self) -> Result<CheckReport> {
        let writer = self.writer.lock();
        self.check_locked(&writer)
    }

    fn check_locked(&self, writer: &WriterState) -> Result<CheckReport> {
        let report = check_tree(&self.store, writer.header.root_block)?;

        let free = self.store.free_blocks();
        if let Some(index) = free.iter().find(|index| report.blocks.contains(index)) {
            return Err(PakError::invariant(format!(
                "block {} is both reachable and free",
                index
            )));
        }

        let pending: AHashSet<BlockIndex> = writer.pending.blocks().collect();
        let staged: AHashSet<BlockIndex> = writer
            .staging
            .as_ref()
            .map(|staging| staging.allocated.clone())
            .unwrap_or_default();
        let free_set: AHashSet<BlockIndex> = free.iter().copied().collect();

        let block_count = self.store.block_count();
        let leaked: Vec<BlockIndex> = (0..block_count)
            .filter(|index| {
                !report.blocks.contains(index)
                    && !free_set.contains(index)
                    && !pending.contains(index)
                    && !staged.contains(index)
            })
            .collect();

        Ok(CheckReport {
            commit_seq: writer.header.commit_seq,
            block_count,
            height: report.height,
            entries: report.entries,
            reachable: report.blocks.len(),
            free: free.len(),
            pending: pending.len(),
            leaked,
        })
    }

    /// Return leaked blocks to the free list and commit
    ///
    /// Discards any staged batch first.
    pub fn repair(&self) -> Result<CheckReport> {
        self.ensure_writable()?;
        let mut writer = self.writer.lock();
        if writer.staging.is_some() {
            warn!("repair discards the staged batch");
            self.rollback(&mut writer);
        }

        let report = self.check_locked(&writer)?;
        for index in &report.leaked {
            self.store.free(*index)?;
        }
        if !report.leaked.is_empty() {
            self.commit_locked(&mut writer)?;
            info!(reclaimed = report.leaked.len(), "repaired container");
        }
        Ok(report)
    }

    pub fn stats(&self) -> ContainerStats {
        let writer = self.writer.lock();
        ContainerStats {
            block_size: self.store.geometry().block_size,
            key_width: self.store.geometry().key_width,
            block_count: self.store.block_count(),
            free_blocks: self.store.free_blocks().len(),
            pending_blocks: writer.pending.len(),
            commit_seq: writer.header.commit_seq,
            readers: self.readers.active(),
            read_only: self.read_only,
            cache: self.store.cache_stats(),
        }
    }

    /// Discard any staged batch, persist released blocks and sync
    pub fn close(self) -> Result<()> {
        self.shutdown()?;
        info!(path = %self.path().display(), "closed container");
        Ok(())
    }

    /// Record blocks released since the last commit in the on-disk free list
    fn shutdown(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let mut writer = self.writer.lock();
        if writer.staging.is_some() {
            warn!("closing with a staged batch; discarding it");
            self.rollback(&mut writer);
        }
        self.release_ready(&mut writer)?;
        self.commit_locked(&mut writer)?;
        self.store.sync()
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(PakError::ReadOnly);
        }
        Ok(())
    }
}

impl Drop for ContainerSession {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "failed to persist released blocks on drop");
        }
    }
}

impl fmt::Debug for ContainerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerSession")
            .field("path", &self.path())
            .field("read_only", &self.read_only)
            .field("committed", &self.commit_point())
            .finish_non_exhaustive()
    }
}

/// Retry an I/O step once before giving up
fn retry_once<T>(step: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    match op() {
        Err(e @ PakError::Io(_)) => {
            warn!(step, error = %e, transient = e.is_transient(), "I/O error during commit; retrying");
            op()
        }
        other => other,
    }
}

/// A pinned view of one committed root
///
/// Blocks reachable from the root stay allocated while the snapshot lives.
pub struct Snapshot<'a> {
    session: &'a ContainerSession,
    point: CommitPoint,
}

impl<'a> Snapshot<'a> {
    pub fn root(&self) -> BlockIndex {
        self.point.root
    }

    pub fn seq(&self) -> u64 {
        self.point.seq
    }

    fn tree(&self) -> BTree {
        BTree::new(self.point.root)
    }

    pub fn lookup(&self, key: &Key) -> Result<ValueLocator> {
        self.tree().lookup(self, key)
    }

    pub fn get(&self, key: &Key) -> Result<Vec<u8>> {
        self.tree().get(self, key)
    }

    pub fn contains(&self, key: &Key) -> Result<bool> {
        self.tree().contains(self, key)
    }

    /// Read up to `len` bytes at `offset`; short at end of value
    pub fn read(&self, key: &Key, offset: u64, len: usize) -> Result<Vec<u8>> {
        let locator = self.lookup(key)?;
        extent::read_value(self, &locator, offset, len)
    }

    pub fn value_len(&self, key: &Key) -> Result<u64> {
        Ok(self.lookup(key)?.len())
    }

    pub fn height(&self) -> Result<usize> {
        self.tree().height(self)
    }

    pub fn iter(&self, prefix: &[u8]) -> Cursor<'_, Self> {
        Cursor::new(self, self.point.root, prefix)
    }
}

impl NodeStore for Snapshot<'_> {
    fn geometry(&self) -> Geometry {
        *self.session.store.geometry()
    }

    fn load(&self, index: BlockIndex) -> Result<Arc<Block>> {
        self.session.store.read(index)
    }
}

impl Drop for Snapshot<'_> {
    fn drop(&mut self) {
        self.session.readers.unregister(self.point.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HEADER_SIZE;
    use tempfile::TempDir;

    fn config() -> PakConfig {
        PakConfig {
            block_size: 512,
            key_width: 8,
            cache_capacity: 64,
            ..PakConfig::default()
        }
    }

    fn key(n: u64) -> Key {
        Key::from_bytes(&n.to_be_bytes(), 8).unwrap()
    }

    fn inserts(range: std::ops::Range<u64>) -> Vec<BatchOp> {
        range
            .map(|n| BatchOp::Insert(key(n), format!("v{}", n).into_bytes()))
            .collect()
    }

    #[test]
    fn test_create_apply_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.pak");

        let session = ContainerSession::create(&path, config()).unwrap();
        let result = session.apply(inserts(0..300)).unwrap();
        assert_eq!(result.seq, 1);
        session.close().unwrap();

        let session = ContainerSession::open(&path, config()).unwrap();
        for n in 0..300 {
            assert_eq!(session.get(&key(n)).unwrap(), format!("v{}", n).into_bytes());
        }
        assert!(session.check().unwrap().is_clean());
    }

    #[test]
    fn test_delete_miss_aborts_batch() {
        let dir = TempDir::new().unwrap();
        let session = ContainerSession::create(dir.path().join("c.pak"), config()).unwrap();
        session.apply(inserts(0..10)).unwrap();
        let before = session.commit_point();

        let mut ops = inserts(100..110);
        ops.push(BatchOp::Delete(key(5000)));
        assert!(matches!(session.apply(ops), Err(PakError::NotFound(_))));

        assert_eq!(session.commit_point(), before);
        assert!(!session.contains(&key(100)).unwrap());
        assert!(session.check().unwrap().is_clean());
    }

    #[test]
    fn test_abort_discards_staging() {
        let dir = TempDir::new().unwrap();
        let session = ContainerSession::create(dir.path().join("c.pak"), config()).unwrap();
        session.apply(inserts(0..50)).unwrap();
        let blocks = session.stats().block_count;

        session.stage(inserts(50..400)).unwrap();
        assert!(session.abort().unwrap() > 0);
        assert_eq!(session.stats().block_count, blocks);
        assert!(!session.contains(&key(60)).unwrap());

        // Nothing staged: committing is a no-op
        let result = session.commit().unwrap();
        assert_eq!(result.written, 0);
    }

    #[test]
    fn test_flushed_batch_without_header_is_invisible_after_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.pak");
        let session = ContainerSession::create(&path, config()).unwrap();
        session.apply(inserts(0..100)).unwrap();
        session.apply(vec![BatchOp::Delete(key(3))]).unwrap();

        session.stage(inserts(1000..1200)).unwrap();
        session.stage(vec![BatchOp::Delete(key(7))]).unwrap();
        // Crash after the blocks hit the disk but before the header write
        session.store.flush_staged().unwrap();
        session.store.flush_free_list().unwrap();
        session.store.sync().unwrap();
        std::mem::forget(session);

        let session = ContainerSession::open(&path, config()).unwrap();
        assert!(session.contains(&key(7)).unwrap());
        assert!(!session.contains(&key(3)).unwrap());
        assert!(!session.contains(&key(1000)).unwrap());
        let snapshot = session.snapshot();
        assert_eq!(snapshot.iter(&[]).count(), 99);
        drop(snapshot);

        // Blocks written by the lost batch are reclaimable
        let report = session.repair().unwrap();
        assert!(session.check().unwrap().is_clean());
        assert_eq!(report.entries, 99);
    }

    #[test]
    fn test_snapshot_isolation_and_deferred_release() {
        let dir = TempDir::new().unwrap();
        let session = ContainerSession::create(dir.path().join("c.pak"), config()).unwrap();
        session.apply(vec![BatchOp::Insert(key(1), b"old".to_vec())]).unwrap();

        let snapshot = session.snapshot();
        let result = session
            .apply(vec![BatchOp::Insert(key(1), b"new".to_vec())])
            .unwrap();
        assert!(result.retired > 0);

        assert_eq!(snapshot.get(&key(1)).unwrap(), b"old");
        assert_eq!(session.get(&key(1)).unwrap(), b"new");
        assert_eq!(session.stats().pending_blocks, result.retired);

        // Further commits must not reuse the blocks the snapshot reaches
        for n in 0..20u64 {
            session
                .apply(vec![BatchOp::Insert(key(100 + n), vec![n as u8; 300])])
                .unwrap();
        }
        assert_eq!(snapshot.get(&key(1)).unwrap(), b"old");
        drop(snapshot);

        session.apply(vec![BatchOp::Insert(key(2), b"x".to_vec())]).unwrap();
        assert_eq!(session.stats().pending_blocks, 0);
        assert!(session.check().unwrap().is_clean());
    }

    #[test]
    fn test_large_values_use_extents() {
        let dir = TempDir::new().unwrap();
        let session = ContainerSession::create(dir.path().join("c.pak"), config()).unwrap();
        let big: Vec<u8> = (0..20_000u32).map(|i| (i % 253) as u8).collect();
        session.apply(vec![BatchOp::Insert(key(9), big.clone())]).unwrap();

        let snapshot = session.snapshot();
        assert_eq!(snapshot.value_len(&key(9)).unwrap(), 20_000);
        assert_eq!(snapshot.read(&key(9), 1000, 10).unwrap(), &big[1000..1010]);
        assert_eq!(snapshot.read(&key(9), 19_995, 100).unwrap(), &big[19_995..]);
        drop(snapshot);

        session.apply(vec![BatchOp::Delete(key(9))]).unwrap();
        session.apply(vec![]).unwrap();
        let report = session.check().unwrap();
        assert!(report.is_clean());
        assert_eq!(report.reachable, 1);
    }

    #[test]
    fn test_deadline_aborts() {
        let dir = TempDir::new().unwrap();
        let session = ContainerSession::create(dir.path().join("c.pak"), config()).unwrap();
        let past = Instant::now();
        assert!(matches!(
            session.apply_until(inserts(0..5), Some(past)),
            Err(PakError::TimedOut)
        ));
        assert!(!session.contains(&key(0)).unwrap());
    }

    #[test]
    fn test_leaked_blocks_repaired() {
        let dir = TempDir::new().unwrap();
        let session = ContainerSession::create(dir.path().join("c.pak"), config()).unwrap();
        session.apply(inserts(0..20)).unwrap();

        let mut leaked = vec![session.store.allocate().unwrap(), session.store.allocate().unwrap()];
        leaked.sort_unstable();
        let free_before = session.stats().free_blocks;
        session.commit().unwrap();

        let report = session.check().unwrap();
        assert_eq!(report.leaked, leaked);

        session.repair().unwrap();
        assert!(session.check().unwrap().is_clean());
        assert_eq!(session.stats().free_blocks, free_before + 2);
    }

    #[test]
    fn test_unsynced_header_keeps_commit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.pak");
        let session = ContainerSession::create(&path, config()).unwrap();
        session.apply(inserts(0..50)).unwrap();
        let before = session.commit_point();

        // The block sync passes; both attempts at the header sync fail
        session.store.file().fail_syncs(1, 2);
        let result = session.apply(inserts(50..120)).unwrap();
        assert!(!result.durable);
        assert_eq!(result.seq, before.seq + 1);
        assert_eq!(session.commit_point().seq, before.seq + 1);
        assert_eq!(session.get(&key(100)).unwrap(), b"v100");
        assert!(session.check().unwrap().is_clean());

        // Allocation state follows the header on disk
        let result = session.apply(inserts(120..130)).unwrap();
        assert!(result.durable);
        session.close().unwrap();

        let session = ContainerSession::open(&path, config()).unwrap();
        for n in 0..130 {
            assert!(session.contains(&key(n)).unwrap());
        }
        assert!(session.check().unwrap().is_clean());
    }

    #[test]
    fn test_drop_persists_released_blocks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.pak");
        let session = ContainerSession::create(&path, config()).unwrap();
        session.apply(inserts(0..200)).unwrap();
        let result = session.apply(vec![BatchOp::Delete(key(3))]).unwrap();
        assert!(result.retired > 0);
        session.stage(inserts(500..510)).unwrap();
        drop(session);

        let session = ContainerSession::open(&path, config()).unwrap();
        assert!(!session.contains(&key(3)).unwrap());
        assert!(!session.contains(&key(500)).unwrap());
        let report = session.check().unwrap();
        assert!(report.is_clean(), "{:?}", report);
        assert!(report.free >= result.retired);
    }

    #[test]
    fn test_version_policy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.pak");
        ContainerSession::create(&path, config()).unwrap().close().unwrap();

        let (file, mut header) = ContainerFile::open(&path, true).unwrap();
        header.version_minor += 1;
        file.write_header(&header).unwrap();
        drop(file);

        let session = ContainerSession::open(&path, config()).unwrap();
        assert!(session.is_read_only());
        assert!(matches!(session.apply(inserts(0..1)), Err(PakError::ReadOnly)));
        drop(session);

        let mut bytes = std::fs::read(&path).unwrap();
        header.version_major += 1;
        bytes[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(
            ContainerSession::open(&path, config()),
            Err(PakError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn test_corrupt_root_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.pak");
        ContainerSession::create(&path, config()).unwrap().close().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_SIZE] = 0;
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(
            ContainerSession::open(&path, config()),
            Err(PakError::CorruptFormat(_))
        ));
    }
}
