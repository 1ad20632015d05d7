//! Hard size limits
//!
//! These bound journal records, books and resident journal memory. They are
//! part of the on-disk contract and must not change without a format bump.

/// Maximum journal record payload (16 KiB)
pub const MAX_RECORD_PAYLOAD: usize = 16 * 1024;

/// Maximum size of one journal book file (16 MiB)
pub const MAX_BOOK_SIZE: u64 = 16 * 1024 * 1024;

/// Maximum unflushed journal memory (64 MiB)
pub const MAX_RESIDENT_JOURNAL: u64 = 64 * 1024 * 1024;

/// Default cap on a single stored object (64 MiB)
pub const DEFAULT_MAX_OBJECT_SIZE: usize = 64 * 1024 * 1024;
