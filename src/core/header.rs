//! Container header (sector 0)
//!
//! The header is a single 512-byte sector at the start of the file. It holds
//! the geometry of the container and the only mutable state that defines the
//! committed snapshot: the root block pointer and the free-list head. A commit
//! ends with exactly one write of this sector.

use crate::error::{PakError, Result};

pub const MAGIC: [u8; 8] = *b"PAKB\x00\x01\x00\x00";
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

/// Size of the header region; block 0 starts right after it
pub const HEADER_SIZE: usize = 512;

/// Sentinel for "no block" in on-disk pointers
pub const NO_BLOCK: u64 = u64::MAX;

pub const MIN_BLOCK_SIZE: u32 = 256;
pub const MAX_BLOCK_SIZE: u32 = 65536;
pub const MIN_KEY_WIDTH: u16 = 4;
pub const MAX_KEY_WIDTH: u16 = 64;

/// Byte offset of the CRC32 field (it covers everything before it)
const CHECKSUM_OFFSET: usize = 56;

/// Container header
///
/// ```text
/// 0   magic[8]        8   version_major  10  version_minor
/// 12  block_size u32  16  key_width u16  18  reserved[6]
/// 24  root_block u64  32  free_head u64  40  block_count u64
/// 48  commit_seq u64  56  crc32 u32      60  zero padding
/// ```
///
/// All integers are big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: [u8; 8],
    pub version_major: u16,
    pub version_minor: u16,

    /// Block size in bytes (power of two, fixed at creation)
    pub block_size: u32,

    /// Width of every key in the tree
    pub key_width: u16,

    /// Block index of the B-tree root
    pub root_block: u64,

    /// Head of the free-block chain, or `NO_BLOCK`
    pub free_head: u64,

    /// Number of blocks in the file
    pub block_count: u64,

    /// Incremented by every commit
    pub commit_seq: u64,
}

impl Header {
    pub fn new(block_size: u32, key_width: u16) -> Self {
        Header {
            magic: MAGIC,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            block_size,
            key_width,
            root_block: 0,
            free_head: NO_BLOCK,
            block_count: 0,
            commit_seq: 0,
        }
    }

    /// Validate magic, version and geometry
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(PakError::corrupt("invalid magic in header"));
        }

        if self.version_major > VERSION_MAJOR {
            return Err(PakError::UnsupportedVersion {
                major: self.version_major,
                minor: self.version_minor,
            });
        }

        if !self.block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size)
        {
            return Err(PakError::corrupt(format!(
                "invalid block size {}",
                self.block_size
            )));
        }

        if !(MIN_KEY_WIDTH..=MAX_KEY_WIDTH).contains(&self.key_width) {
            return Err(PakError::corrupt(format!(
                "invalid key width {}",
                self.key_width
            )));
        }

        let extent = self
            .block_count
            .checked_mul(self.block_size as u64)
            .and_then(|bytes| bytes.checked_add(HEADER_SIZE as u64));
        if extent.is_none() {
            return Err(PakError::corrupt(format!(
                "{} blocks of {} bytes overflow the file offset range",
                self.block_count, self.block_size
            )));
        }

        if self.root_block >= self.block_count {
            return Err(PakError::corrupt(format!(
                "root block {} outside {} blocks",
                self.root_block, self.block_count
            )));
        }

        if self.free_head != NO_BLOCK && self.free_head >= self.block_count {
            return Err(PakError::corrupt(format!(
                "free-list head {} outside {} blocks",
                self.free_head, self.block_count
            )));
        }

        Ok(())
    }

    /// Whether this header was written by a newer minor revision of the format
    pub fn is_newer_minor(&self) -> bool {
        self.version_major == VERSION_MAJOR && self.version_minor > VERSION_MINOR
    }

    /// Byte offset of a block inside the container file
    pub fn block_offset(&self, index: u64) -> u64 {
        HEADER_SIZE as u64 + index * self.block_size as u64
    }

    /// Serialize header to one sector
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];

        bytes[0..8].copy_from_slice(&self.magic);
        bytes[8..10].copy_from_slice(&self.version_major.to_be_bytes());
        bytes[10..12].copy_from_slice(&self.version_minor.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.block_size.to_be_bytes());
        bytes[16..18].copy_from_slice(&self.key_width.to_be_bytes());
        bytes[24..32].copy_from_slice(&self.root_block.to_be_bytes());
        bytes[32..40].copy_from_slice(&self.free_head.to_be_bytes());
        bytes[40..48].copy_from_slice(&self.block_count.to_be_bytes());
        bytes[48..56].copy_from_slice(&self.commit_seq.to_be_bytes());

        let crc = crc32fast::hash(&bytes[..CHECKSUM_OFFSET]);
        bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&crc.to_be_bytes());

        bytes
    }

    /// Deserialize and validate a header sector
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(PakError::corrupt(format!(
                "header truncated: {} bytes",
                bytes.len()
            )));
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);
        if magic != MAGIC {
            return Err(PakError::corrupt("invalid magic in header"));
        }

        let stored_crc = u32::from_be_bytes(be_array(&bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]));
        if crc32fast::hash(&bytes[..CHECKSUM_OFFSET]) != stored_crc {
            return Err(PakError::corrupt("header checksum mismatch"));
        }

        let header = Header {
            magic,
            version_major: u16::from_be_bytes(be_array(&bytes[8..10])),
            version_minor: u16::from_be_bytes(be_array(&bytes[10..12])),
            block_size: u32::from_be_bytes(be_array(&bytes[12..16])),
            key_width: u16::from_be_bytes(be_array(&bytes[16..18])),
            root_block: u64::from_be_bytes(be_array(&bytes[24..32])),
            free_head: u64::from_be_bytes(be_array(&bytes[32..40])),
            block_count: u64::from_be_bytes(be_array(&bytes[40..48])),
            commit_seq: u64::from_be_bytes(be_array(&bytes[48..56])),
        };

        header.validate()?;

        Ok(header)
    }
}

/// Copy a slice of known length into a fixed array
pub(crate) fn be_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}
