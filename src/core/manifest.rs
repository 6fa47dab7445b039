//! Path catalog: hierarchical paths on top of the flat keyed store
//!
//! The tree only knows fixed-width keys. The manifest maps each file path to a
//! stable file id (and so to its content key) plus the metadata a filesystem
//! needs. Directories are implicit: a directory exists when some entry lies
//! below it or when an explicit marker was created by `mkdir`.
//!
//! The whole manifest is stored as one record under the reserved `_index`
//! key, so it commits atomically with the content it describes.

use crate::error::{PakError, Result};
use crate::key::Key;
use crate::validation::{dir_prefix, file_name, is_inside, parent};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Reserved key name of the manifest record
pub const INDEX_NAME: &str = "_index";

const RECORD_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
}

/// One catalog entry (a file, or an explicit directory marker)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub kind: EntryKind,
    /// Stable file id the content key is derived from (0 for directories)
    pub id: u64,
    pub size: u64,
    /// Modification time, Unix seconds
    pub modified: i64,
    /// Manifest revision of the last change
    pub tag: u64,
}

impl ManifestEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Content key of a file entry
    pub fn key(&self, width: u16) -> Option<Key> {
        match self.kind {
            EntryKind::File => Some(Key::for_file(self.id, width)),
            EntryKind::Directory => None,
        }
    }

    pub fn modified_time(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.modified, 0)
            .single()
            .unwrap_or_default()
    }
}

/// What a path resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node<'a> {
    File(&'a ManifestEntry),
    /// A directory, with its marker if it has one
    Directory(Option<&'a ManifestEntry>),
}

impl Node<'_> {
    pub fn kind(&self) -> EntryKind {
        match self {
            Node::File(_) => EntryKind::File,
            Node::Directory(_) => EntryKind::Directory,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ManifestRecord {
    version: u32,
    next_id: u64,
    revision: u64,
    entries: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    entries: BTreeMap<String, ManifestEntry>,
    next_id: u64,
    revision: u64,
    key_width: u16,
}

impl Manifest {
    pub fn new(key_width: u16) -> Self {
        Manifest {
            entries: BTreeMap::new(),
            next_id: 1,
            revision: 0,
            key_width,
        }
    }

    /// Key the manifest record is stored under
    pub fn index_key(key_width: u16) -> Key {
        Key::reserved(INDEX_NAME, key_width)
    }

    pub fn from_bytes(bytes: &[u8], key_width: u16) -> Result<Self> {
        let record: ManifestRecord = bincode::deserialize(bytes)?;
        if record.version > RECORD_VERSION {
            return Err(PakError::corrupt(format!(
                "manifest record version {} is newer than {}",
                record.version, RECORD_VERSION
            )));
        }
        let entries = record
            .entries
            .into_iter()
            .map(|entry| (entry.path.clone(), entry))
            .collect();
        Ok(Manifest {
            entries,
            next_id: record.next_id,
            revision: record.revision,
            key_width,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let record = ManifestRecord {
            version: RECORD_VERSION,
            next_id: self.next_id,
            revision: self.revision,
            entries: self.entries.values().cloned().collect(),
        };
        Ok(bincode::serialize(&record)?)
    }

    pub fn key_width(&self) -> u16 {
        self.key_width
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Number of files (directory markers excluded)
    pub fn file_count(&self) -> usize {
        self.files().count()
    }

    pub fn files(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.values().filter(|entry| !entry.is_dir())
    }

    pub fn total_size(&self) -> u64 {
        self.files().map(|entry| entry.size).sum()
    }

    /// Entry stored at exactly `path`
    pub fn entry(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.get(path)
    }

    /// Resolve a normalized path to a file or directory
    pub fn lookup(&self, path: &str) -> Result<Node<'_>> {
        if path == "/" {
            return Ok(Node::Directory(self.entries.get("/")));
        }
        match self.entries.get(path) {
            Some(entry) if entry.is_dir() => Ok(Node::Directory(Some(entry))),
            Some(entry) => Ok(Node::File(entry)),
            None if self.has_descendants(path) => Ok(Node::Directory(None)),
            None => Err(PakError::NotFound(path.to_string())),
        }
    }

    /// Content key of the file at `path`
    pub fn resolve(&self, path: &str) -> Result<Key> {
        match self.lookup(path)? {
            Node::File(entry) => Ok(Key::for_file(entry.id, self.key_width)),
            Node::Directory(_) => Err(PakError::NotAFile(path.to_string())),
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.lookup(path), Ok(Node::Directory(_)))
    }

    /// Immediate children of a directory, sorted by name
    pub fn children(&self, path: &str) -> Result<Vec<(String, EntryKind)>> {
        if let Node::File(_) = self.lookup(path)? {
            return Err(PakError::NotADirectory(path.to_string()));
        }

        let prefix = dir_prefix(path);
        let mut names: BTreeMap<String, EntryKind> = BTreeMap::new();
        for (entry_path, entry) in self.scan(&prefix) {
            let rest = &entry_path[prefix.len()..];
            if rest.is_empty() {
                continue;
            }
            match rest.split_once('/') {
                Some((name, _)) => {
                    names.insert(name.to_string(), EntryKind::Directory);
                }
                None => {
                    names.entry(rest.to_string()).or_insert(entry.kind);
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Register (or update) the file at `path`, allocating an id if needed
    pub fn register(&mut self, path: &str, size: u64) -> Result<&ManifestEntry> {
        self.check_parent(path)?;
        if self.is_dir(path) {
            return Err(PakError::NotAFile(path.to_string()));
        }

        let id = match self.entries.get(path) {
            Some(entry) => entry.id,
            None => self.allocate_id(),
        };
        let tag = self.bump();
        let entry = ManifestEntry {
            path: path.to_string(),
            kind: EntryKind::File,
            id,
            size,
            modified: Utc::now().timestamp(),
            tag,
        };
        self.entries.insert(path.to_string(), entry);
        self.entries
            .get(path)
            .ok_or_else(|| PakError::NotFound(path.to_string()))
    }

    /// Register a new, empty file; fails if anything exists at `path`
    pub fn create_file(&mut self, path: &str) -> Result<&ManifestEntry> {
        if self.lookup(path).is_ok() {
            return Err(PakError::AlreadyExists(path.to_string()));
        }
        self.register(path, 0)
    }

    /// Remove a file entry, returning it
    pub fn unregister(&mut self, path: &str) -> Result<ManifestEntry> {
        match self.lookup(path)? {
            Node::File(_) => {}
            Node::Directory(_) => return Err(PakError::NotAFile(path.to_string())),
        }
        self.bump();
        self.entries
            .remove(path)
            .ok_or_else(|| PakError::NotFound(path.to_string()))
    }

    /// Create an explicit directory marker
    pub fn mkdir(&mut self, path: &str) -> Result<&ManifestEntry> {
        if path == "/" || self.lookup(path).is_ok() {
            return Err(PakError::AlreadyExists(path.to_string()));
        }
        self.check_parent(path)?;

        let tag = self.bump();
        let entry = ManifestEntry {
            path: path.to_string(),
            kind: EntryKind::Directory,
            id: 0,
            size: 0,
            modified: Utc::now().timestamp(),
            tag,
        };
        self.entries.insert(path.to_string(), entry);
        self.entries
            .get(path)
            .ok_or_else(|| PakError::NotFound(path.to_string()))
    }

    /// Remove an empty directory marker
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        if path == "/" {
            return Err(PakError::InvalidPath("cannot remove the root".to_string()));
        }
        match self.lookup(path)? {
            Node::File(_) => Err(PakError::NotADirectory(path.to_string())),
            Node::Directory(_) if self.has_descendants(path) => {
                Err(PakError::DirectoryNotEmpty(path.to_string()))
            }
            Node::Directory(_) => {
                self.bump();
                self.entries.remove(path);
                Ok(())
            }
        }
    }

    /// Move a file or directory; content keys never change
    ///
    /// Returns the file displaced when `to` named an existing file.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<Option<ManifestEntry>> {
        if from == "/" || to == "/" {
            return Err(PakError::InvalidPath("cannot rename the root".to_string()));
        }
        let source_kind = self.lookup(from)?.kind();
        if from == to {
            return Ok(None);
        }
        if is_inside(to, from) {
            return Err(PakError::InvalidPath(format!(
                "cannot move '{}' inside itself",
                from
            )));
        }
        self.check_parent(to)?;

        let target = self.lookup(to).ok().map(|node| node.kind());
        let displaced = match (source_kind, target) {
            (_, None) => None,
            (EntryKind::File, Some(EntryKind::File)) => self.entries.remove(to),
            (EntryKind::File, Some(EntryKind::Directory)) => {
                return Err(PakError::NotAFile(to.to_string()))
            }
            (EntryKind::Directory, Some(EntryKind::File)) => {
                return Err(PakError::NotADirectory(to.to_string()))
            }
            (EntryKind::Directory, Some(EntryKind::Directory)) => {
                if self.has_descendants(to) {
                    return Err(PakError::DirectoryNotEmpty(to.to_string()));
                }
                self.entries.remove(to);
                None
            }
        };

        let tag = self.bump();
        let now = Utc::now().timestamp();
        let mut moved: Vec<String> = vec![from.to_string()];
        if source_kind == EntryKind::Directory {
            moved.extend(self.scan(&dir_prefix(from)).map(|(path, _)| path.clone()));
        }

        for old_path in moved {
            let Some(mut entry) = self.entries.remove(&old_path) else {
                // Implicit directories have no entry of their own
                continue;
            };
            let new_path = format!("{}{}", to, &old_path[from.len()..]);
            entry.path = new_path.clone();
            entry.tag = tag;
            if old_path == from {
                entry.modified = now;
            }
            self.entries.insert(new_path, entry);
        }

        Ok(displaced)
    }

    /// Record a new size for a file after its content changed
    pub fn update(&mut self, path: &str, size: u64) -> Result<&ManifestEntry> {
        match self.lookup(path)? {
            Node::File(_) => self.register(path, size),
            Node::Directory(_) => Err(PakError::NotAFile(path.to_string())),
        }
    }

    /// Entry of the file with the given id
    pub fn find_id(&self, id: u64) -> Option<&ManifestEntry> {
        self.files().find(|entry| entry.id == id)
    }

    fn scan<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a String, &'a ManifestEntry)> + 'a {
        self.entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(path, _)| path.starts_with(prefix))
    }

    fn has_descendants(&self, path: &str) -> bool {
        let prefix = dir_prefix(path);
        let found = self
            .scan(&prefix)
            .any(|(entry_path, _)| entry_path.as_str() != prefix);
        found
    }

    /// The parent of `path` must not be a file
    fn check_parent(&self, path: &str) -> Result<()> {
        let mut dir = parent(path);
        while dir != "/" {
            if let Some(entry) = self.entries.get(dir) {
                if !entry.is_dir() {
                    return Err(PakError::NotADirectory(dir.to_string()));
                }
            }
            dir = parent(dir);
        }
        if file_name(path).is_empty() {
            return Err(PakError::InvalidPath(path.to_string()));
        }
        Ok(())
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }
}
