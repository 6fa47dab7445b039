//! Fixed-width tree keys
//!
//! Every key in a container has the same width (recorded in the header).
//! Content keys are derived from a stable file id rather than from the path
//! text, so renaming a file never re-keys its content. Reserved keys hold
//! container metadata such as the manifest.

use crate::error::{PakError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const FILE_DOMAIN: &[u8] = b"pakfs.file\0";

/// A fixed-width key, ordered byte-wise
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(Vec<u8>);

impl Key {
    /// Wrap raw key bytes, checking the width
    pub fn from_bytes(bytes: &[u8], width: u16) -> Result<Self> {
        if bytes.len() != width as usize {
            return Err(PakError::corrupt(format!(
                "key of {} bytes in a container with {}-byte keys",
                bytes.len(),
                width
            )));
        }
        Ok(Key(bytes.to_vec()))
    }

    /// Content key for a file id
    pub fn for_file(id: u64, width: u16) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(FILE_DOMAIN);
        hasher.update(id.to_be_bytes());
        Self::truncated(hasher.finalize().as_slice(), width)
    }

    /// Key of a reserved container entry (e.g. `_index`)
    pub fn reserved(name: &str, width: u16) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        Self::truncated(digest.as_slice(), width)
    }

    /// Key with every byte set to `byte` (useful for bounds)
    pub fn filled(byte: u8, width: u16) -> Self {
        Key(vec![byte; width as usize])
    }

    fn truncated(digest: &[u8], width: u16) -> Self {
        let width = width as usize;
        let mut bytes = Vec::with_capacity(width);
        // Widths beyond 32 bytes are padded by re-hashing the digest
        let mut block = digest.to_vec();
        while bytes.len() < width {
            let take = (width - bytes.len()).min(block.len());
            bytes.extend_from_slice(&block[..take]);
            block = Sha256::digest(&block).to_vec();
        }
        Key(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn width(&self) -> usize {
        self.0.len()
    }

    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.0.starts_with(prefix)
    }

    /// Lowercase hex rendering
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.to_hex())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_keys_are_stable_and_distinct() {
        assert_eq!(Key::for_file(7, 32), Key::for_file(7, 32));
        assert_ne!(Key::for_file(7, 32), Key::for_file(8, 32));
        assert_eq!(Key::for_file(7, 32).width(), 32);
    }

    #[test]
    fn test_reserved_key_matches_sha256() {
        let key = Key::reserved("_index", 32);
        let digest = Sha256::digest(b"_index");
        assert_eq!(key.as_bytes(), digest.as_slice());
    }

    #[test]
    fn test_width_truncation_and_extension() {
        let short = Key::reserved("_index", 8);
        let full = Key::reserved("_index", 32);
        assert_eq!(short.as_bytes(), &full.as_bytes()[..8]);

        let long = Key::reserved("_index", 64);
        assert_eq!(long.width(), 64);
        assert_eq!(&long.as_bytes()[..32], full.as_bytes());
    }

    #[test]
    fn test_from_bytes_checks_width() {
        assert!(Key::from_bytes(&[1, 2, 3, 4], 4).is_ok());
        assert!(matches!(
            Key::from_bytes(&[1, 2, 3], 4),
            Err(PakError::CorruptFormat(_))
        ));
    }

    #[test]
    fn test_lexicographic_order() {
        let a = Key::from_bytes(&[0, 0, 0, 1], 4).unwrap();
        let b = Key::from_bytes(&[0, 0, 1, 0], 4).unwrap();
        assert!(a < b);
        assert!(Key::filled(0xff, 4) > b);
    }
}
