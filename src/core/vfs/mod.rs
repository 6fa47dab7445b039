//! Filesystem projection of a container
//!
//! This module presents the flat keyed store as a directory tree:
//!
//! - Path lookup, listing and attributes backed by the manifest
//! - Open-file handles with buffered, coalescing writes
//! - Atomic flush: file content and manifest commit in one batch
//! - A request/reply boundary with errno mapping for transports

mod fs;
mod handle;
mod protocol;


pub use fs::{DirEntry, FileAttr, FsStats, HandleId, PakFs};
pub use handle::OpenFile;
pub use protocol::{dispatch, Reply, Request};
