//! Journal configuration.

use crystal_core::limits::{MAX_BOOK_SIZE, MAX_RECORD_PAYLOAD, MAX_RESIDENT_JOURNAL};
use serde::{Deserialize, Serialize};

use crate::format::{BOOK_HEADER_SIZE, FRAME_OVERHEAD};

/// Smallest book that can still hold one maximum-size record.
pub const MIN_BOOK_SIZE: u64 = (BOOK_HEADER_SIZE + FRAME_OVERHEAD + MAX_RECORD_PAYLOAD) as u64;

/// Journal configuration parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Whether mutations are journaled at all (default: true).
    ///
    /// When false the coordinator installs the no-op journal.
    pub enabled: bool,

    /// Book directory, relative to the data directory (default: "journal").
    pub directory: String,

    /// Maximum book size in bytes (default: 16MB).
    ///
    /// When the active book cannot take the next record, it is sealed and a
    /// new book is started.
    pub book_size: u64,

    /// Cap on unflushed journal bytes held in memory (default: 64MB).
    pub max_resident_bytes: u64,

    /// Pending bytes in the active book that trigger a background write
    /// (default: 1MB).
    pub chunk_size: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        JournalConfig {
            enabled: true,
            directory: "journal".to_string(),
            book_size: MAX_BOOK_SIZE,
            max_resident_bytes: MAX_RESIDENT_JOURNAL,
            chunk_size: 1024 * 1024,
        }
    }
}

impl JournalConfig {
    /// Create a new journal configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable journaling (builder pattern).
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set book size (builder pattern).
    pub fn with_book_size(mut self, size: u64) -> Self {
        self.book_size = size;
        self
    }

    /// Set resident memory cap (builder pattern).
    pub fn with_max_resident_bytes(mut self, bytes: u64) -> Self {
        self.max_resident_bytes = bytes;
        self
    }

    /// Set background write threshold (builder pattern).
    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), JournalConfigError> {
        if self.directory.is_empty() {
            return Err(JournalConfigError::EmptyDirectory);
        }
        if self.book_size < MIN_BOOK_SIZE {
            return Err(JournalConfigError::BookSizeTooSmall(MIN_BOOK_SIZE));
        }
        if self.book_size > MAX_BOOK_SIZE {
            return Err(JournalConfigError::BookSizeTooLarge(MAX_BOOK_SIZE));
        }
        if self.max_resident_bytes < self.book_size {
            return Err(JournalConfigError::ResidentBelowBookSize);
        }
        if self.max_resident_bytes > MAX_RESIDENT_JOURNAL {
            return Err(JournalConfigError::ResidentTooLarge(MAX_RESIDENT_JOURNAL));
        }
        if self.chunk_size == 0 || self.chunk_size > self.book_size {
            return Err(JournalConfigError::InvalidChunkSize);
        }
        Ok(())
    }

    /// Create a configuration optimized for testing (small books).
    pub fn for_testing() -> Self {
        JournalConfig {
            enabled: true,
            directory: "journal".to_string(),
            book_size: 64 * 1024,          // 64KB for faster rotation in tests
            max_resident_bytes: 256 * 1024, // 256KB
            chunk_size: 4 * 1024,           // 4KB
        }
    }
}

/// Journal configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JournalConfigError {
    /// Directory name is empty.
    #[error("Journal directory must not be empty")]
    EmptyDirectory,

    /// Book cannot hold a maximum-size record.
    #[error("Book size must be at least {0} bytes")]
    BookSizeTooSmall(u64),

    /// Book exceeds the hard limit.
    #[error("Book size must not exceed {0} bytes")]
    BookSizeTooLarge(u64),

    /// Resident cap smaller than a single book.
    #[error("Resident memory cap cannot be smaller than the book size")]
    ResidentBelowBookSize,

    /// Resident cap exceeds the hard limit.
    #[error("Resident memory cap must not exceed {0} bytes")]
    ResidentTooLarge(u64),

    /// Chunk size is zero or larger than a book.
    #[error("Chunk size must be between 1 byte and the book size")]
    InvalidChunkSize,
}
