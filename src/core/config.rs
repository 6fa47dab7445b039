//! Container configuration
//!
//! Geometry settings (`block_size`, `key_width`) only apply when a container
//! is created; an existing container always uses the geometry in its header.
//!
//! ```toml
//! block_size = 4096
//! key_width = 32
//! cache_capacity = 1024
//! dirty_handles = "flush"
//! max_file_size = 1073741824
//! read_only = false
//! ```

use crate::block::Geometry;
use crate::error::{PakError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use validator::Validate;

pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
pub const DEFAULT_KEY_WIDTH: u16 = 32;
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1 << 30;

/// What `close` does with open handles that still hold unflushed writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirtyHandlePolicy {
    #[default]
    Flush,
    Discard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct PakConfig {
    /// Block size for new containers (power of two)
    #[validate(range(min = 256, max = 65536))]
    pub block_size: u32,

    /// Key width for new containers
    #[validate(range(min = 4, max = 64))]
    pub key_width: u16,

    /// Clean blocks kept in the cache
    #[validate(range(min = 1))]
    pub cache_capacity: usize,

    pub dirty_handles: DirtyHandlePolicy,

    /// Largest file the filesystem layer accepts; a flush holds the whole
    /// file in memory
    #[validate(range(min = 1))]
    pub max_file_size: u64,

    pub read_only: bool,
}

impl Default for PakConfig {
    fn default() -> Self {
        PakConfig {
            block_size: DEFAULT_BLOCK_SIZE,
            key_width: DEFAULT_KEY_WIDTH,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            dirty_handles: DirtyHandlePolicy::default(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            read_only: false,
        }
    }
}

impl PakConfig {
    /// Parse and check a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: PakConfig =
            toml::from_str(text).map_err(|e| PakError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Load a TOML config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PakError::Config(e.to_string()))
    }

    /// Field rules plus the geometry constraints between them
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| PakError::Config(e.to_string()))?;

        if !self.block_size.is_power_of_two() {
            return Err(PakError::Config(format!(
                "block_size {} is not a power of two",
                self.block_size
            )));
        }
        self.geometry()?;
        Ok(())
    }

    pub fn geometry(&self) -> Result<Geometry> {
        Geometry::new(self.block_size, self.key_width)
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PakConfig::default();
        assert!(config.check().is_ok());
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.dirty_handles, DirtyHandlePolicy::Flush);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = PakConfig::from_toml_str("block_size = 512\ndirty_handles = \"discard\"\n").unwrap();
        assert_eq!(config.block_size, 512);
        assert_eq!(config.key_width, DEFAULT_KEY_WIDTH);
        assert_eq!(config.dirty_handles, DirtyHandlePolicy::Discard);
    }

    #[test]
    fn test_rejects_bad_geometry() {
        assert!(matches!(
            PakConfig::from_toml_str("block_size = 1000"),
            Err(PakError::Config(_))
        ));
        assert!(matches!(
            PakConfig::from_toml_str("block_size = 128"),
            Err(PakError::Config(_))
        ));
        assert!(matches!(
            PakConfig::from_toml_str("key_width = 2"),
            Err(PakError::Config(_))
        ));
        assert!(matches!(
            PakConfig::from_toml_str("cache_capacity = 0"),
            Err(PakError::Config(_))
        ));
        assert!(matches!(
            PakConfig::from_toml_str("max_file_size = 0"),
            Err(PakError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_fields() {
        assert!(PakConfig::from_toml_str("compression = true").is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = PakConfig::default().read_only(true);
        let text = config.to_toml_string().unwrap();
        assert_eq!(PakConfig::from_toml_str(&text).unwrap(), config);
    }
}
