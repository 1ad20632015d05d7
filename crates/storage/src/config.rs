//! Filer and storage configuration.

use crystal_core::limits::DEFAULT_MAX_OBJECT_SIZE;
use crystal_core::Wait;
use serde::{Deserialize, Serialize};

/// Filer parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilerConfig {
    /// fsync file data after every write (default: true).
    #[serde(default = "default_sync_writes")]
    pub sync_writes: bool,

    /// Cached buffers per size class in the engine's buffer pool (default: 32).
    #[serde(default = "default_pool_per_class")]
    pub pool_per_class: usize,
}

fn default_sync_writes() -> bool {
    true
}

fn default_pool_per_class() -> usize {
    32
}

impl Default for FilerConfig {
    fn default() -> Self {
        FilerConfig {
            sync_writes: default_sync_writes(),
            pool_per_class: default_pool_per_class(),
        }
    }
}

impl FilerConfig {
    /// Set write syncing (builder pattern).
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Create a configuration for tests (no fsync).
    pub fn for_testing() -> Self {
        FilerConfig {
            sync_writes: false,
            pool_per_class: 8,
        }
    }
}

/// Largest payload an object header can describe.
pub const MAX_FRAMED_OBJECT_SIZE: usize = u32::MAX as usize;

/// Storage parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory below the data directory holding objects (default: "storage").
    #[serde(default = "default_directory")]
    pub directory: String,

    /// Largest payload accepted by `put` (default: 64MB, at most 4GB - 1).
    #[serde(default = "default_max_object_size")]
    pub max_object_size: usize,

    /// How long data-unit loads and saves wait for the filer, 0 = forever.
    #[serde(default)]
    pub wait_ms: u64,
}

fn default_directory() -> String {
    "storage".to_string()
}

fn default_max_object_size() -> usize {
    DEFAULT_MAX_OBJECT_SIZE
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            directory: default_directory(),
            max_object_size: default_max_object_size(),
            wait_ms: 0,
        }
    }
}

impl StorageConfig {
    /// Set the object size cap (builder pattern).
    pub fn with_max_object_size(mut self, size: usize) -> Self {
        self.max_object_size = size;
        self
    }

    /// Set the caller wait (builder pattern).
    pub fn with_wait_ms(mut self, ms: u64) -> Self {
        self.wait_ms = ms;
        self
    }

    /// Wait policy derived from `wait_ms`.
    pub fn wait(&self) -> Wait {
        Wait::from_millis(self.wait_ms)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), StorageConfigError> {
        if self.directory.is_empty() {
            return Err(StorageConfigError::EmptyDirectory);
        }
        if self.max_object_size == 0 {
            return Err(StorageConfigError::ZeroObjectSize);
        }
        if self.max_object_size > MAX_FRAMED_OBJECT_SIZE {
            return Err(StorageConfigError::ObjectSizeTooLarge(self.max_object_size));
        }
        Ok(())
    }
}

/// Storage configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageConfigError {
    /// Directory name is empty.
    #[error("Storage directory must not be empty")]
    EmptyDirectory,

    /// Object size cap is zero.
    #[error("Maximum object size must be greater than zero")]
    ZeroObjectSize,

    /// Object size cap does not fit the 32-bit length field.
    #[error("Maximum object size {0} exceeds {MAX_FRAMED_OBJECT_SIZE}")]
    ObjectSizeTooLarge(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = StorageConfig::default();
        assert_eq!(config.directory, "storage");
        assert_eq!(config.max_object_size, 64 * 1024 * 1024);
        assert_eq!(config.wait(), Wait::Infinite);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = StorageConfig::default()
            .with_max_object_size(1024)
            .with_wait_ms(50);
        assert_eq!(config.max_object_size, 1024);
        assert_eq!(config.wait(), Wait::Timeout(Duration::from_millis(50)));
    }

    #[test]
    fn test_validation() {
        let config = StorageConfig::default().with_max_object_size(0);
        assert!(matches!(
            config.validate(),
            Err(StorageConfigError::ZeroObjectSize)
        ));

        let config = StorageConfig {
            directory: String::new(),
            ..StorageConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StorageConfigError::EmptyDirectory)
        ));

        let config = StorageConfig::default().with_max_object_size(MAX_FRAMED_OBJECT_SIZE);
        assert!(config.validate().is_ok());
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_object_size_above_header_range_rejected() {
        let config = StorageConfig::default().with_max_object_size(MAX_FRAMED_OBJECT_SIZE + 1);
        assert_eq!(
            config.validate(),
            Err(StorageConfigError::ObjectSizeTooLarge(
                MAX_FRAMED_OBJECT_SIZE + 1
            ))
        );
    }

    #[test]
    fn test_filer_testing_config() {
        let config = FilerConfig::for_testing();
        assert!(!config.sync_writes);
        assert!(FilerConfig::default().sync_writes);
    }
}
