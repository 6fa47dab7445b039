use thiserror::Error;

#[derive(Error, Debug)]
pub enum PakError {
    #[error("Corrupt container format: {0}")]
    CorruptFormat(String),

    #[error("Unsupported format version: {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Not a file: {0}")]
    NotAFile(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Invalid block: {0}")]
    InvalidBlock(u64),

    #[error("B-tree invariant violated: {0}")]
    TreeInvariantViolation(String),

    #[error("Container is opened read-only")]
    ReadOnly,

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Unknown file handle: {0}")]
    BadHandle(u64),

    #[error("Request deadline exceeded")]
    TimedOut,

    #[error("Value too large: {0} bytes")]
    ValueTooLarge(u64),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PakError {
    /// Shorthand for a `CorruptFormat` error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        PakError::CorruptFormat(msg.into())
    }

    /// Shorthand for a `TreeInvariantViolation` error
    pub fn invariant(msg: impl Into<String>) -> Self {
        PakError::TreeInvariantViolation(msg.into())
    }

    /// Whether a failed operation may succeed if attempted again
    pub fn is_transient(&self) -> bool {
        match self {
            PakError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// POSIX errno for filesystem transports
    pub fn errno(&self) -> i32 {
        match self {
            PakError::NotFound(_) => libc::ENOENT,
            PakError::AlreadyExists(_) => libc::EEXIST,
            PakError::NotADirectory(_) => libc::ENOTDIR,
            PakError::NotAFile(_) => libc::EISDIR,
            PakError::DirectoryNotEmpty(_) => libc::ENOTEMPTY,
            PakError::ReadOnly => libc::EROFS,
            PakError::InvalidPath(_) | PakError::Config(_) => libc::EINVAL,
            PakError::BadHandle(_) => libc::EBADF,
            PakError::TimedOut => libc::ETIMEDOUT,
            PakError::ValueTooLarge(_) => libc::EFBIG,
            PakError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            PakError::CorruptFormat(_)
            | PakError::UnsupportedVersion { .. }
            | PakError::InvalidBlock(_)
            | PakError::TreeInvariantViolation(_)
            | PakError::Serialization(_) => libc::EIO,
        }
    }
}

pub type Result<T> = std::result::Result<T, PakError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(PakError::NotFound("/x".into()).errno(), libc::ENOENT);
        assert_eq!(PakError::NotAFile("/d".into()).errno(), libc::EISDIR);
        assert_eq!(PakError::ReadOnly.errno(), libc::EROFS);
        assert_eq!(PakError::corrupt("bad tag").errno(), libc::EIO);
        assert_eq!(PakError::invariant("unsorted").errno(), libc::EIO);
    }

    #[test]
    fn test_transient_io() {
        let transient = PakError::Io(std::io::Error::from(std::io::ErrorKind::Interrupted));
        assert!(transient.is_transient());

        let fatal = PakError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!fatal.is_transient());
        assert!(!PakError::NotFound("k".into()).is_transient());
    }
}
