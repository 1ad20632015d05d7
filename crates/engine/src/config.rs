//! Engine configuration via `crystal.toml`
//!
//! A default `crystal.toml` is written into the data directory on first
//! open. To change settings, edit the file and restart.

use crystal_durability::{JournalConfig, JournalConfigError};
use crystal_storage::{FilerConfig, StorageConfig, StorageConfigError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file name placed in the data directory.
pub const CONFIG_FILE_NAME: &str = "crystal.toml";

/// When the data tree is written to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrystallizationPolicy {
    /// Nothing is persisted; storage and journal are no-ops
    None,
    /// Only explicit `crystallize()` calls and `stop()` save the tree
    Manual,
    /// A background thread saves the tree every `interval_secs`
    Periodic,
    /// Every mutation saves the unit and its manifest chain before returning
    Instant,
}

impl CrystallizationPolicy {
    /// Whether storage is backed by files
    pub fn persists(&self) -> bool {
        !matches!(self, CrystallizationPolicy::None)
    }

    /// Whether mutations go to the file journal
    pub fn journals(&self) -> bool {
        matches!(
            self,
            CrystallizationPolicy::Manual | CrystallizationPolicy::Periodic
        )
    }
}

/// Eviction cache parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HimoConfig {
    /// Seconds between eviction cycles (default: 60).
    pub interval_secs: u64,
    /// Resident payload bytes above which oldest units are unloaded
    /// (default: 256MB).
    pub memory_size_limit: u64,
}

impl Default for HimoConfig {
    fn default() -> Self {
        HimoConfig {
            interval_secs: 60,
            memory_size_limit: 256 * 1024 * 1024,
        }
    }
}

impl HimoConfig {
    /// Wake-up interval of the eviction thread.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Engine configuration loaded from `crystal.toml`.
///
/// # Example
///
/// ```toml
/// crystallization = "periodic"
/// interval_secs = 3600
///
/// [himo]
/// memory_size_limit = 268435456
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrystalConfig {
    /// Crystallization policy.
    #[serde(default = "default_policy")]
    pub crystallization: CrystallizationPolicy,
    /// Seconds between periodic saves.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Filer settings shared by storage and journal.
    #[serde(default)]
    pub filer: FilerConfig,
    /// Object storage settings.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Journal settings.
    #[serde(default)]
    pub journal: JournalConfig,
    /// Eviction settings.
    #[serde(default)]
    pub himo: HimoConfig,
}

fn default_policy() -> CrystallizationPolicy {
    CrystallizationPolicy::Periodic
}

fn default_interval_secs() -> u64 {
    3600
}

impl Default for CrystalConfig {
    fn default() -> Self {
        CrystalConfig {
            crystallization: default_policy(),
            interval_secs: default_interval_secs(),
            filer: FilerConfig::default(),
            storage: StorageConfig::default(),
            journal: JournalConfig::default(),
            himo: HimoConfig::default(),
        }
    }
}

impl CrystalConfig {
    /// Set the crystallization policy (builder pattern).
    pub fn with_policy(mut self, policy: CrystallizationPolicy) -> Self {
        self.crystallization = policy;
        self
    }

    /// Set the periodic save interval (builder pattern).
    pub fn with_interval_secs(mut self, secs: u64) -> Self {
        self.interval_secs = secs;
        self
    }

    /// Set the eviction settings (builder pattern).
    pub fn with_himo(mut self, himo: HimoConfig) -> Self {
        self.himo = himo;
        self
    }

    /// Small, unsynced configuration for tests.
    pub fn for_testing() -> Self {
        CrystalConfig {
            crystallization: CrystallizationPolicy::Manual,
            interval_secs: 3600,
            filer: FilerConfig::for_testing(),
            storage: StorageConfig::default(),
            journal: JournalConfig::for_testing(),
            himo: HimoConfig {
                interval_secs: 3600,
                memory_size_limit: 1024 * 1024,
            },
        }
    }

    /// Periodic save interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.crystallization == CrystallizationPolicy::Periodic && self.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "interval_secs must be greater than zero for periodic crystallization".into(),
            ));
        }
        if self.himo.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "himo.interval_secs must be greater than zero".into(),
            ));
        }
        self.storage.validate()?;
        self.journal.validate()?;
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Crystal configuration
#
# When the data tree is written to storage:
#   "none"     = keep everything in memory, nothing is persisted
#   "manual"   = save on crystallize() and on stop
#   "periodic" = save every interval_secs (default)
#   "instant"  = save every mutation before it returns
crystallization = "periodic"
interval_secs = 3600

[filer]
# fsync after every write
sync_writes = true
# Cached buffers per size class in the engine's buffer pool
pool_per_class = 32

[storage]
directory = "storage"
max_object_size = 67108864
# How long loads and saves wait for the filer, 0 = forever
wait_ms = 0

[journal]
enabled = true
directory = "journal"
book_size = 16777216
max_resident_bytes = 67108864
chunk_size = 1048576

[himo]
# Seconds between eviction cycles
interval_secs = 60
# Resident payload bytes kept before oldest units are unloaded
memory_size_limit = 268435456
"#
    }

    /// Read and parse config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let config: CrystalConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<(), ConfigError> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| ConfigError::Io {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read or written
    #[error("Config file '{}': {message}", path.display())]
    Io {
        /// File path
        path: PathBuf,
        /// I/O error text
        message: String,
    },

    /// Config file is not valid TOML for this schema
    #[error("Failed to parse config file '{}': {message}", path.display())]
    Parse {
        /// File path
        path: PathBuf,
        /// Parser error text
        message: String,
    },

    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// Storage section rejected
    #[error(transparent)]
    Storage(#[from] StorageConfigError),

    /// Journal section rejected
    #[error(transparent)]
    Journal(#[from] JournalConfigError),
}
