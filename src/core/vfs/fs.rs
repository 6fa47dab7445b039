//! Path-projection adapter
//!
//! Projects the manifest and the keyed store as a hierarchical filesystem.
//! Every mutation commits the content change together with the updated
//! manifest record in one batch, so a crash never separates the two.
//!
//! Mutations are serialized by a mutation lock held across their commit.
//! The state lock guarding the manifest and handle table is only held for
//! in-memory work; container reads and commits happen outside it.

use super::handle::{apply_regions, OpenFile};
use crate::config::{DirtyHandlePolicy, PakConfig};
use crate::error::{PakError, Result};
use crate::key::Key;
use crate::manifest::{EntryKind, Manifest, ManifestEntry, Node};
use crate::session::{BatchOp, ContainerSession, Snapshot};
use crate::validation::{is_inside, normalize_path};
use ahash::AHashMap;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

pub type HandleId = u64;

/// Attributes of a file or directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileAttr {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Unix seconds (0 for implicit directories)
    pub modified: i64,
    /// Manifest revision of the last change
    pub tag: u64,
    pub id: u64,
}

impl FileAttr {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    fn from_entry(entry: &ManifestEntry) -> Self {
        FileAttr {
            path: entry.path.clone(),
            kind: entry.kind,
            size: entry.size,
            modified: entry.modified,
            tag: entry.tag,
            id: entry.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// Filesystem statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FsStats {
    pub block_size: u32,
    pub block_count: u64,
    pub free_blocks: usize,
    pub files: usize,
    pub total_size: u64,
    pub revision: u64,
    pub commit_seq: u64,
    pub open_handles: usize,
    pub read_only: bool,
}

struct FsState {
    manifest: Manifest,
    handles: AHashMap<HandleId, OpenFile>,
    next_handle: HandleId,
    /// Monotonic write counter, orders modifications across handles
    writes: u64,
}

impl FsState {
    fn handle(&self, id: HandleId) -> Result<&OpenFile> {
        self.handles.get(&id).ok_or(PakError::BadHandle(id))
    }

    fn handle_mut(&mut self, id: HandleId) -> Result<&mut OpenFile> {
        self.handles.get_mut(&id).ok_or(PakError::BadHandle(id))
    }

    fn insert_handle(&mut self, file: OpenFile) -> HandleId {
        let id = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(id, file);
        id
    }

    fn stamp(&mut self) -> u64 {
        self.writes += 1;
        self.writes
    }

    /// Logical size of the most recently modified dirty handle on a file
    fn dirty_size(&self, id: u64) -> Option<u64> {
        self.handles
            .values()
            .filter(|file| file.id == id && file.is_dirty())
            .max_by_key(|file| file.touched())
            .map(|file| file.size())
    }

    /// Point every other handle on file `id` at its newly committed value
    fn follow_commit(&mut self, id: u64, committed_len: u64, except: Option<HandleId>) {
        for (handle, file) in self.handles.iter_mut() {
            if file.id != id || Some(*handle) == except {
                continue;
            }
            if file.is_dirty() {
                file.rebase(committed_len);
            } else {
                file.discard(committed_len);
            }
        }
    }
}

/// A handle read split into the part taken under the state lock and the
/// container read done after it is released
struct ReadPlan {
    key: Key,
    offset: u64,
    len: usize,
    /// Leading bytes that come from the committed value
    base: usize,
    regions: Vec<(u64, Vec<u8>)>,
}

impl ReadPlan {
    fn new(file: &OpenFile, offset: u64, len: u64) -> Result<Self> {
        let size = file.size();
        let end = size.min(offset.saturating_add(len)).max(offset);
        let base_end = end.min(file.base_len()).max(offset);
        Ok(ReadPlan {
            key: file.key.clone(),
            offset,
            len: to_len(end - offset)?,
            base: to_len(base_end - offset)?,
            regions: file.regions_in(offset, end),
        })
    }

    fn execute(self, snapshot: &Snapshot<'_>) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.len];
        if self.base > 0 {
            let committed = snapshot.read(&self.key, self.offset, self.base)?;
            buf[..committed.len()].copy_from_slice(&committed);
        }
        apply_regions(&mut buf, self.offset, &self.regions);
        Ok(buf)
    }
}

/// A container projected as a filesystem
pub struct PakFs {
    session: ContainerSession,
    policy: DirtyHandlePolicy,
    max_file_size: u64,
    state: Mutex<FsState>,
    pub(super) mutation: Mutex<()>,
}

impl PakFs {
    /// Create a new container with an empty manifest
    pub fn create<P: AsRef<Path>>(path: P, config: PakConfig) -> Result<Self> {
        let session = ContainerSession::create(path, config)?;
        let manifest = Manifest::new(session.key_width());
        session.apply(vec![BatchOp::Insert(
            Manifest::index_key(session.key_width()),
            manifest.to_bytes()?,
        )])?;
        Ok(Self::with_manifest(session, manifest))
    }

    pub fn open<P: AsRef<Path>>(path: P, config: PakConfig) -> Result<Self> {
        Self::from_session(ContainerSession::open(path, config)?)
    }

    /// Wrap an open session, loading its manifest
    ///
    /// A container without a manifest record projects as an empty root.
    pub fn from_session(session: ContainerSession) -> Result<Self> {
        let width = session.key_width();
        let manifest = match session.get(&Manifest::index_key(width)) {
            Ok(bytes) => Manifest::from_bytes(&bytes, width)?,
            Err(PakError::NotFound(_)) => {
                warn!("container has no manifest record; starting empty");
                Manifest::new(width)
            }
            Err(e) => return Err(e),
        };
        info!(
            files = manifest.file_count(),
            revision = manifest.revision(),
            "loaded manifest"
        );
        Ok(Self::with_manifest(session, manifest))
    }

    fn with_manifest(session: ContainerSession, manifest: Manifest) -> Self {
        PakFs {
            policy: session.config().dirty_handles,
            max_file_size: session.config().max_file_size,
            session,
            state: Mutex::new(FsState {
                manifest,
                handles: AHashMap::new(),
                next_handle: 1,
                writes: 0,
            }),
            mutation: Mutex::new(()),
        }
    }

    pub fn session(&self) -> &ContainerSession {
        &self.session
    }

    pub fn is_read_only(&self) -> bool {
        self.session.is_read_only()
    }

    fn key_width(&self) -> u16 {
        self.session.key_width()
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.session.is_read_only() {
            return Err(PakError::ReadOnly);
        }
        Ok(())
    }

    fn check_size(&self, size: u64) -> Result<usize> {
        if size > self.max_file_size {
            return Err(PakError::ValueTooLarge(size));
        }
        to_len(size)
    }

    /// Start a mutation: the mutation lock plus a copy of the manifest
    fn begin(&self) -> (MutexGuard<'_, ()>, Manifest) {
        let guard = self.mutation.lock();
        let manifest = self.state.lock().manifest.clone();
        (guard, manifest)
    }

    /// Commit `ops` plus the new manifest record, then publish the manifest
    ///
    /// Called with the mutation lock held. The returned state guard lets the
    /// caller update handles in the same critical section as the swap.
    fn commit(
        &self,
        manifest: Manifest,
        mut ops: Vec<BatchOp>,
        deadline: Option<Instant>,
    ) -> Result<MutexGuard<'_, FsState>> {
        ops.push(BatchOp::Insert(
            Manifest::index_key(manifest.key_width()),
            manifest.to_bytes()?,
        ));
        let result = self.session.apply_until(ops, deadline)?;
        debug!(seq = result.seq, revision = manifest.revision(), "manifest committed");
        let mut state = self.state.lock();
        state.manifest = manifest;
        Ok(state)
    }

    pub fn getattr(&self, path: &str) -> Result<FileAttr> {
        let path = normalize_path(path)?;
        let state = self.state.lock();
        match state.manifest.lookup(&path)? {
            Node::File(entry) => {
                let mut attr = FileAttr::from_entry(entry);
                if let Some(size) = state.dirty_size(entry.id) {
                    attr.size = size;
                }
                Ok(attr)
            }
            Node::Directory(Some(marker)) => Ok(FileAttr::from_entry(marker)),
            Node::Directory(None) => Ok(FileAttr {
                path,
                kind: EntryKind::Directory,
                size: 0,
                modified: 0,
                tag: 0,
                id: 0,
            }),
        }
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        match self.getattr(path) {
            Ok(_) => Ok(true),
            Err(PakError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let path = normalize_path(path)?;
        let state = self.state.lock();
        Ok(state
            .manifest
            .children(&path)?
            .into_iter()
            .map(|(name, kind)| DirEntry { name, kind })
            .collect())
    }

    /// Every file at or below `path`, in path order
    pub fn files_under(&self, path: &str) -> Result<Vec<FileAttr>> {
        let path = normalize_path(path)?;
        let state = self.state.lock();
        if let Node::File(entry) = state.manifest.lookup(&path)? {
            return Ok(vec![FileAttr::from_entry(entry)]);
        }
        Ok(state
            .manifest
            .files()
            .filter(|entry| is_inside(&entry.path, &path))
            .map(FileAttr::from_entry)
            .collect())
    }

    /// Open a file; `write` asks for a handle that accepts writes
    pub fn open_file(&self, path: &str, write: bool) -> Result<HandleId> {
        if write {
            self.ensure_writable()?;
        }
        let path = normalize_path(path)?;
        let mut state = self.state.lock();
        let file = match state.manifest.lookup(&path)? {
            Node::File(entry) => OpenFile::new(
                entry.id,
                Key::for_file(entry.id, self.key_width()),
                write,
                entry.size,
            ),
            Node::Directory(_) => return Err(PakError::NotAFile(path)),
        };
        let handle = state.insert_handle(file);
        debug!(handle, path = %path, write, "opened file");
        Ok(handle)
    }

    /// Read up to `len` bytes at `offset`; reads past the end come back short
    pub fn read(&self, handle: HandleId, offset: u64, len: usize) -> Result<Vec<u8>> {
        let (plan, snapshot) = {
            let state = self.state.lock();
            let plan = ReadPlan::new(state.handle(handle)?, offset, len as u64)?;
            (plan, self.session.snapshot())
        };
        plan.execute(&snapshot)
    }

    /// Buffer a write; nothing is committed until the handle is flushed
    pub fn write(&self, handle: HandleId, offset: u64, data: &[u8]) -> Result<usize> {
        self.ensure_writable()?;
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(PakError::ValueTooLarge(u64::MAX))?;
        self.check_size(end)?;

        let mut state = self.state.lock();
        let stamp = state.stamp();
        let file = state.handle_mut(handle)?;
        if !file.writable {
            return Err(PakError::BadHandle(handle));
        }
        file.write(offset, data, stamp);
        Ok(data.len())
    }

    /// Resize an open file; applied to the container on the next flush
    pub fn ftruncate(&self, handle: HandleId, size: u64) -> Result<()> {
        self.ensure_writable()?;
        self.check_size(size)?;
        let mut state = self.state.lock();
        let stamp = state.stamp();
        let file = state.handle_mut(handle)?;
        if !file.writable {
            return Err(PakError::BadHandle(handle));
        }
        file.truncate(size, stamp);
        Ok(())
    }

    /// Commit a handle's buffered writes; a clean handle is a no-op
    ///
    /// Other handles on the same file see the new content afterwards.
    pub fn flush(&self, handle: HandleId, deadline: Option<Instant>) -> Result<()> {
        let _mutation = self.mutation.lock();

        let (plan, snapshot, mut manifest, path, id, stamp) = {
            let mut state = self.state.lock();
            let file = state.handle(handle)?;
            if !file.is_dirty() {
                return Ok(());
            }
            let (id, stamp) = (file.id, file.touched());
            let Some(path) = state.manifest.find_id(id).map(|entry| entry.path.clone()) else {
                debug!(handle, "file was removed while open; dropping buffered writes");
                state.handle_mut(handle)?.discard(0);
                return Ok(());
            };
            let file = state.handle(handle)?;
            let plan = ReadPlan::new(file, 0, file.size())?;
            let manifest = state.manifest.clone();
            (plan, self.session.snapshot(), manifest, path, id, stamp)
        };

        let key = plan.key.clone();
        let content = plan.execute(&snapshot)?;
        drop(snapshot);
        let size = content.len() as u64;
        manifest.update(&path, size)?;

        let mut state = self.commit(manifest, vec![BatchOp::Insert(key, content)], deadline)?;
        if let Ok(file) = state.handle_mut(handle) {
            // Writes buffered while the commit ran stay dirty
            if file.touched() == stamp {
                file.mark_clean();
            } else {
                file.rebase(size);
            }
        }
        state.follow_commit(id, size, Some(handle));
        debug!(handle, path = %path, size, "flushed file");
        Ok(())
    }

    pub fn fsync(&self, handle: HandleId, deadline: Option<Instant>) -> Result<()> {
        self.flush(handle, deadline)
    }

    /// Flush and close a handle
    ///
    /// The handle is closed even when the flush fails; the flush error is
    /// still returned.
    pub fn release(&self, handle: HandleId, deadline: Option<Instant>) -> Result<()> {
        self.state.lock().handle(handle)?;
        let flushed = self.flush(handle, deadline);
        if let Err(e) = &flushed {
            warn!(handle, error = %e, "flush on release failed; buffered writes dropped");
        }
        self.state.lock().handles.remove(&handle);
        flushed
    }

    /// Create an empty file, committed immediately, and open it for writing
    pub fn create_file(&self, path: &str, deadline: Option<Instant>) -> Result<HandleId> {
        self.ensure_writable()?;
        let path = normalize_path(path)?;
        let (_mutation, mut manifest) = self.begin();

        let id = manifest.create_file(&path)?.id;
        let key = Key::for_file(id, self.key_width());
        let mut state = self.commit(
            manifest,
            vec![BatchOp::Insert(key.clone(), Vec::new())],
            deadline,
        )?;

        info!(path = %path, id, "created file");
        Ok(state.insert_handle(OpenFile::new(id, key, true, 0)))
    }

    /// Replace a file's whole content in one commit, creating it if needed
    ///
    /// Open handles on the file move to the new content; buffered writes in
    /// them are kept on top of it.
    pub fn write_file(&self, path: &str, content: &[u8], deadline: Option<Instant>) -> Result<FileAttr> {
        self.ensure_writable()?;
        let path = normalize_path(path)?;
        self.check_size(content.len() as u64)?;
        let (_mutation, mut manifest) = self.begin();

        let entry = manifest.register(&path, content.len() as u64)?.clone();
        let key = Key::for_file(entry.id, self.key_width());
        let mut state = self.commit(manifest, vec![BatchOp::Insert(key, content.to_vec())], deadline)?;

        state.follow_commit(entry.id, entry.size, None);
        Ok(FileAttr::from_entry(&entry))
    }

    /// Read a file's whole committed content
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let path = normalize_path(path)?;
        let key = self.state.lock().manifest.resolve(&path)?;
        self.session.get(&key)
    }

    /// Resize a file by path, zero-padding when it grows
    pub fn truncate(&self, path: &str, size: u64, deadline: Option<Instant>) -> Result<()> {
        self.ensure_writable()?;
        let path = normalize_path(path)?;
        let len = self.check_size(size)?;
        let (_mutation, mut manifest) = self.begin();

        let id = match manifest.lookup(&path)? {
            Node::File(entry) => entry.id,
            Node::Directory(_) => return Err(PakError::NotAFile(path)),
        };
        let key = Key::for_file(id, self.key_width());
        let mut content = if len > 0 {
            self.session.snapshot().read(&key, 0, len)?
        } else {
            Vec::new()
        };
        content.resize(len, 0);

        manifest.update(&path, size)?;
        let mut state = self.commit(manifest, vec![BatchOp::Insert(key, content)], deadline)?;

        let stamp = state.stamp();
        for file in state.handles.values_mut().filter(|file| file.id == id) {
            let was_dirty = file.is_dirty();
            file.truncate(size, stamp);
            if !was_dirty {
                file.mark_clean();
            }
        }
        debug!(path = %path, size, "truncated file");
        Ok(())
    }

    /// Remove a file; open handles on it become orphans
    pub fn unlink(&self, path: &str, deadline: Option<Instant>) -> Result<()> {
        self.ensure_writable()?;
        let path = normalize_path(path)?;
        let (_mutation, mut manifest) = self.begin();

        let entry = manifest.unregister(&path)?;
        let key = Key::for_file(entry.id, self.key_width());
        drop(self.commit(manifest, vec![BatchOp::Delete(key)], deadline)?);

        info!(path = %path, id = entry.id, "removed file");
        Ok(())
    }

    /// Move a file or directory; a file at `to` is replaced
    pub fn rename(&self, from: &str, to: &str, deadline: Option<Instant>) -> Result<()> {
        self.ensure_writable()?;
        let from = normalize_path(from)?;
        let to = normalize_path(to)?;
        let (_mutation, mut manifest) = self.begin();

        let displaced = manifest.rename(&from, &to)?;
        if from == to {
            return Ok(());
        }
        let width = self.key_width();
        let ops = displaced
            .iter()
            .filter_map(|entry| entry.key(width))
            .map(BatchOp::Delete)
            .collect();
        drop(self.commit(manifest, ops, deadline)?);

        info!(from = %from, to = %to, replaced = displaced.is_some(), "renamed");
        Ok(())
    }

    pub fn mkdir(&self, path: &str, deadline: Option<Instant>) -> Result<()> {
        self.ensure_writable()?;
        let path = normalize_path(path)?;
        let (_mutation, mut manifest) = self.begin();

        manifest.mkdir(&path)?;
        self.commit(manifest, Vec::new(), deadline).map(drop)
    }

    pub fn rmdir(&self, path: &str, deadline: Option<Instant>) -> Result<()> {
        self.ensure_writable()?;
        let path = normalize_path(path)?;
        let (_mutation, mut manifest) = self.begin();

        manifest.rmdir(&path)?;
        self.commit(manifest, Vec::new(), deadline).map(drop)
    }

    pub fn statfs(&self) -> FsStats {
        let stats = self.session.stats();
        let state = self.state.lock();
        FsStats {
            block_size: stats.block_size,
            block_count: stats.block_count,
            free_blocks: stats.free_blocks,
            files: state.manifest.file_count(),
            total_size: state.manifest.total_size(),
            revision: state.manifest.revision(),
            commit_seq: stats.commit_seq,
            open_handles: state.handles.len(),
            read_only: stats.read_only,
        }
    }

    /// Close every handle per the dirty-handle policy, then the session
    ///
    /// With the flush policy every dirty handle is attempted; the first
    /// failure is returned after the session has been closed.
    pub fn close(self) -> Result<()> {
        let mut dirty: Vec<HandleId> = self
            .state
            .lock()
            .handles
            .iter()
            .filter(|(_, file)| file.is_dirty())
            .map(|(id, _)| *id)
            .collect();
        dirty.sort_unstable();

        let mut first_error = None;
        match self.policy {
            DirtyHandlePolicy::Flush => {
                for handle in dirty {
                    if let Err(e) = self.flush(handle, None) {
                        warn!(handle, error = %e, "flush on close failed");
                        first_error.get_or_insert(e);
                    }
                }
            }
            DirtyHandlePolicy::Discard if !dirty.is_empty() => {
                warn!(handles = dirty.len(), "discarding unflushed writes on close");
            }
            DirtyHandlePolicy::Discard => {}
        }
        self.state.lock().handles.clear();

        self.session.close()?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn to_len(size: u64) -> Result<usize> {
    usize::try_from(size).map_err(|_| PakError::ValueTooLarge(size))
}
