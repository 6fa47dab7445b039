//! # pakfs - Paged B-tree Game Archive Containers
//!
//! `pakfs` reads and writes single-file asset containers: a paged,
//! copy-on-write B+ tree of fixed-width keys, plus a manifest that projects
//! the flat key space as a directory tree.
//!
//! - **Atomic commits**: the header is the only block ever overwritten; a
//!   crash leaves the previous commit intact
//! - **Snapshot readers**: readers see one committed root while a writer stages
//!   the next
//! - **Filesystem projection**: paths, directories, open handles with
//!   buffered writes, rename without re-keying content
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pakfs::{PakConfig, PakFs, Result};
//!
//! # fn main() -> Result<()> {
//! let fs = PakFs::create("assets.pak", PakConfig::default())?;
//!
//! // Whole-file writes commit immediately
//! fs.write_file("/items/sword.png", b"...", None)?;
//!
//! // Handles buffer writes until flushed
//! let handle = fs.create_file("/items/shield.png", None)?;
//! fs.write(handle, 0, b"pixels")?;
//! fs.release(handle, None)?;
//!
//! for entry in fs.readdir("/items")? {
//!     println!("{}", entry.name);
//! }
//! fs.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Keyed Access
//!
//! ```rust,no_run
//! use pakfs::{BatchOp, ContainerSession, Key, PakConfig, Result};
//!
//! # fn main() -> Result<()> {
//! let session = ContainerSession::open("assets.pak", PakConfig::default())?;
//! let key = Key::reserved("settings", session.key_width());
//!
//! session.apply(vec![BatchOp::Insert(key.clone(), b"volume=3".to_vec())])?;
//!
//! let snapshot = session.snapshot();
//! assert_eq!(snapshot.get(&key)?, b"volume=3");
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use self::core::{
    block, buffer_pool, catalog, config, error, header, io, key, manifest, session, snapshot,
    store, validation, vfs,
};

pub use crate::core::{
    block::{BlockIndex, Geometry, ValueLocator},
    catalog::{BTree, Cursor, TreeReport},
    config::{DirtyHandlePolicy, PakConfig},
    error::{PakError, Result},
    header::{Header, HEADER_SIZE, NO_BLOCK},
    key::Key,
    manifest::{EntryKind, Manifest, ManifestEntry},
    session::{BatchOp, CheckReport, CommitResult, ContainerSession, ContainerStats, Snapshot},
    snapshot::CommitPoint,
    vfs::{dispatch, DirEntry, FileAttr, FsStats, HandleId, PakFs, Reply, Request},
};
