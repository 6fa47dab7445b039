//! Disk I/O for container files
//!
//! All access is positional (`pread`/`pwrite`), so readers can share the file
//! with the writer without seeking.

use crate::block::BlockIndex;
use crate::error::{PakError, Result};
use crate::header::{Header, HEADER_SIZE};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Disk-backed container storage
pub struct ContainerFile {
    file: File,
    path: PathBuf,
    block_size: usize,
    writable: bool,
    #[cfg(test)]
    faults: SyncFaults,
}

/// Injected `sync` failures: `skip` syncs succeed, then `fail` syncs error
#[cfg(test)]
#[derive(Default)]
struct SyncFaults {
    skip: std::sync::atomic::AtomicU32,
    fail: std::sync::atomic::AtomicU32,
}

impl ContainerFile {
    /// Create a new container file, truncating any existing one
    pub fn create<P: AsRef<Path>>(path: P, header: &Header) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        file.write_all_at(&header.to_bytes(), 0)?;

        Ok(ContainerFile {
            file,
            path: path.as_ref().to_path_buf(),
            block_size: header.block_size as usize,
            writable: true,
            #[cfg(test)]
            faults: SyncFaults::default(),
        })
    }

    /// Open an existing container file and read its header
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> Result<(Self, Header)> {
        let file = OpenOptions::new().read(true).write(writable).open(&path)?;

        let len = file.metadata()?.len();
        if len < HEADER_SIZE as u64 {
            return Err(PakError::corrupt(format!(
                "file of {} bytes is too short for a header",
                len
            )));
        }

        let mut buffer = vec![0u8; HEADER_SIZE];
        file.read_exact_at(&mut buffer, 0)?;
        let header = Header::from_bytes(&buffer)?;

        let container = ContainerFile {
            file,
            path: path.as_ref().to_path_buf(),
            block_size: header.block_size as usize,
            writable,
            #[cfg(test)]
            faults: SyncFaults::default(),
        };
        Ok((container, header))
    }

    /// Write the header sector
    pub fn write_header(&self, header: &Header) -> Result<()> {
        self.check_writable()?;
        self.file.write_all_at(&header.to_bytes(), 0)?;
        Ok(())
    }

    /// Read one raw block
    pub fn read_block(&self, index: BlockIndex) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; self.block_size];
        match self.file.read_exact_at(&mut buffer, self.offset(index)) {
            Ok(()) => Ok(buffer),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(PakError::corrupt(
                format!("block {} lies beyond the end of the file", index),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Write one raw block
    pub fn write_block(&self, index: BlockIndex, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        if data.len() != self.block_size {
            return Err(PakError::invariant(format!(
                "block data must be exactly {} bytes, got {}",
                self.block_size,
                data.len()
            )));
        }
        self.file.write_all_at(data, self.offset(index))?;
        Ok(())
    }

    /// Current file length in bytes
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Sync data and metadata to disk
    pub fn sync(&self) -> Result<()> {
        #[cfg(test)]
        self.injected_sync_fault()?;
        if self.writable {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Let `skip` syncs through, then fail the next `fail` of them
    #[cfg(test)]
    pub(crate) fn fail_syncs(&self, skip: u32, fail: u32) {
        use std::sync::atomic::Ordering;
        self.faults.skip.store(skip, Ordering::SeqCst);
        self.faults.fail.store(fail, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn injected_sync_fault(&self) -> Result<()> {
        use std::sync::atomic::Ordering;
        let step = |n: u32| n.checked_sub(1);
        if self.faults.skip.fetch_update(Ordering::SeqCst, Ordering::SeqCst, step).is_ok() {
            return Ok(());
        }
        if self.faults.fail.fetch_update(Ordering::SeqCst, Ordering::SeqCst, step).is_ok() {
            return Err(std::io::Error::other("injected sync failure").into());
        }
        Ok(())
    }

    fn offset(&self, index: BlockIndex) -> u64 {
        HEADER_SIZE as u64 + index * self.block_size as u64
    }

    fn check_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(PakError::ReadOnly);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn header() -> Header {
        let mut header = Header::new(512, 8);
        header.block_count = 1;
        header
    }

    #[test]
    fn test_create_and_read_header() {
        let temp = NamedTempFile::new().unwrap();
        let header = header();

        ContainerFile::create(temp.path(), &header).unwrap();
        let (_, read_header) = ContainerFile::open(temp.path(), false).unwrap();

        assert_eq!(read_header, header);
    }

    #[test]
    fn test_write_and_read_block() {
        let temp = NamedTempFile::new().unwrap();
        let file = ContainerFile::create(temp.path(), &header()).unwrap();

        let data = vec![0x5a; 512];
        file.write_block(2, &data).unwrap();
        assert_eq!(file.read_block(2).unwrap(), data);
        assert_eq!(file.len().unwrap(), (HEADER_SIZE + 3 * 512) as u64);
    }

    #[test]
    fn test_read_past_end_is_corrupt() {
        let temp = NamedTempFile::new().unwrap();
        let file = ContainerFile::create(temp.path(), &header()).unwrap();
        assert!(matches!(file.read_block(5), Err(PakError::CorruptFormat(_))));
    }

    #[test]
    fn test_wrong_block_length_rejected() {
        let temp = NamedTempFile::new().unwrap();
        let file = ContainerFile::create(temp.path(), &header()).unwrap();
        assert!(file.write_block(0, &[0u8; 100]).is_err());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let temp = NamedTempFile::new().unwrap();
        ContainerFile::create(temp.path(), &header()).unwrap();

        let (file, header) = ContainerFile::open(temp.path(), false).unwrap();
        assert!(matches!(file.write_header(&header), Err(PakError::ReadOnly)));
        assert!(matches!(
            file.write_block(0, &[0u8; 512]),
            Err(PakError::ReadOnly)
        ));
    }

    #[test]
    fn test_short_file_rejected() {
        let temp = NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), b"PAKB").unwrap();
        assert!(matches!(
            ContainerFile::open(temp.path(), false),
            Err(PakError::CorruptFormat(_))
        ));
    }
}
