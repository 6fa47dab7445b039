//! Request/reply boundary for filesystem transports
//!
//! A transport decodes its own wire messages into [`Request`]s, calls
//! [`dispatch`], and encodes the [`Reply`] or the error's
//! [`errno`](crate::error::PakError::errno).

use super::fs::{DirEntry, FileAttr, FsStats, HandleId, PakFs};
use crate::error::{PakError, Result};
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    GetAttr { path: String },
    ReadDir { path: String },
    Open { path: String, write: bool },
    Read { handle: HandleId, offset: u64, len: usize },
    Write { handle: HandleId, offset: u64, data: Vec<u8> },
    Flush { handle: HandleId },
    Fsync { handle: HandleId },
    Release { handle: HandleId },
    Create { path: String },
    Truncate { path: String, size: u64 },
    Ftruncate { handle: HandleId, size: u64 },
    Unlink { path: String },
    Rename { from: String, to: String },
    Mkdir { path: String },
    Rmdir { path: String },
    StatFs,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::GetAttr { .. } => "getattr",
            Request::ReadDir { .. } => "readdir",
            Request::Open { .. } => "open",
            Request::Read { .. } => "read",
            Request::Write { .. } => "write",
            Request::Flush { .. } => "flush",
            Request::Fsync { .. } => "fsync",
            Request::Release { .. } => "release",
            Request::Create { .. } => "create",
            Request::Truncate { .. } => "truncate",
            Request::Ftruncate { .. } => "ftruncate",
            Request::Unlink { .. } => "unlink",
            Request::Rename { .. } => "rename",
            Request::Mkdir { .. } => "mkdir",
            Request::Rmdir { .. } => "rmdir",
            Request::StatFs => "statfs",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Attr(FileAttr),
    Entries(Vec<DirEntry>),
    Opened(HandleId),
    Data(Vec<u8>),
    Written(usize),
    Stats(FsStats),
    Done,
}

/// Run one request against the filesystem
///
/// A request whose deadline has already passed is refused with `TimedOut`;
/// one whose deadline passes while its batch is staged is aborted.
pub fn dispatch(fs: &PakFs, request: Request, deadline: Option<Instant>) -> Result<Reply> {
    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
        return Err(PakError::TimedOut);
    }
    let name = request.name();

    let reply = match request {
        Request::GetAttr { path } => fs.getattr(&path).map(Reply::Attr),
        Request::ReadDir { path } => fs.readdir(&path).map(Reply::Entries),
        Request::Open { path, write } => fs.open_file(&path, write).map(Reply::Opened),
        Request::Read {
            handle,
            offset,
            len,
        } => fs.read(handle, offset, len).map(Reply::Data),
        Request::Write {
            handle,
            offset,
            data,
        } => fs.write(handle, offset, &data).map(Reply::Written),
        Request::Flush { handle } => fs.flush(handle, deadline).map(|_| Reply::Done),
        Request::Fsync { handle } => fs.fsync(handle, deadline).map(|_| Reply::Done),
        Request::Release { handle } => fs.release(handle, deadline).map(|_| Reply::Done),
        Request::Create { path } => fs.create_file(&path, deadline).map(Reply::Opened),
        Request::Truncate { path, size } => fs.truncate(&path, size, deadline).map(|_| Reply::Done),
        Request::Ftruncate { handle, size } => fs.ftruncate(handle, size).map(|_| Reply::Done),
        Request::Unlink { path } => fs.unlink(&path, deadline).map(|_| Reply::Done),
        Request::Rename { from, to } => fs.rename(&from, &to, deadline).map(|_| Reply::Done),
        Request::Mkdir { path } => fs.mkdir(&path, deadline).map(|_| Reply::Done),
        Request::Rmdir { path } => fs.rmdir(&path, deadline).map(|_| Reply::Done),
        Request::StatFs => Ok(Reply::Stats(fs.statfs())),
    };

    if let Err(e) = &reply {
        debug!(op = name, errno = e.errno(), error = %e, "request failed");
    }
    reply
}
