//! Journal abstraction
//!
//! A [`Journal`] is the write-ahead log of the engine. Records are appended
//! under one mutex, so every journal has a single total order of records.
//! Two backends exist:
//!
//! - [`FileJournal`](crate::FileJournal): books on disk, written through a filer
//! - [`NullJournal`](crate::NullJournal): accepts records, keeps nothing
//!
//! # Checkpoints
//!
//! A checkpoint brackets a full save of the data tree:
//!
//! ```text
//! begin_checkpoint()      -> CheckpointBegin{n}
//!   ... save tree, flush storage ...
//! complete_checkpoint()   -> CheckpointEnd{n}, recycle books before Begin{n}
//! ```
//!
//! Recovery replays every record after the `CheckpointBegin` of the last
//! completed checkpoint. Records written during the save are replayed too;
//! replayed operations are idempotent so that overlap is harmless.

use crate::recovery::RecoveryScan;
use crate::writer::JournalWriter;
use crystal_core::{CrystalResult, SharedBuffer, Wait};
use std::fmt;

/// Record type of a checkpoint-begin marker
pub const CHECKPOINT_BEGIN: u8 = 0xF0;

/// Record type of a checkpoint-end marker
pub const CHECKPOINT_END: u8 = 0xF1;

/// Whether `record_type` is reserved for the journal's own markers
pub fn is_reserved_type(record_type: u8) -> bool {
    record_type >= CHECKPOINT_BEGIN
}

/// Position of a record in the journal
///
/// Waypoints order like the records they name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Waypoint {
    /// Sequence number of the book holding the record
    pub book: u64,
    /// Byte offset of the record inside the book
    pub offset: u64,
}

impl Waypoint {
    /// Waypoint of a record that was not stored
    pub const NONE: Waypoint = Waypoint { book: 0, offset: 0 };

    /// Whether this names a stored record
    pub fn is_some(&self) -> bool {
        self.book != 0
    }
}

impl fmt::Display for Waypoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.book, self.offset)
    }
}

/// Token returned by `begin_checkpoint`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointMark {
    /// Checkpoint number
    pub number: u64,
    /// Position of the `CheckpointBegin` record
    pub waypoint: Waypoint,
}

/// Book life cycle
///
/// ```text
/// Active → Sealed → Flushed → Recyclable
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BookState {
    /// Accepting appends
    Active,
    /// Full or closed, bytes still waiting for the disk
    Sealed,
    /// Every byte acknowledged by the filer
    Flushed,
    /// Covered by a completed checkpoint, file being removed
    Recyclable,
}

/// One record, as read back from a book
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    /// Where the record sits
    pub waypoint: Waypoint,
    /// Record type tag
    pub record_type: u8,
    /// Record payload
    pub payload: SharedBuffer,
}

/// Write-ahead log
///
/// # Contract
///
/// - `prepare` must succeed before any record is accepted
/// - Payloads over 16 KiB are rejected with `OverSizeLimit` and never reach
///   a book
/// - Reserved record types are rejected with `InvalidArgument`
/// - `add_record` calls are totally ordered; their waypoints increase in
///   that order
pub trait Journal: Send + Sync {
    /// Open the journal and scan existing books without changing them
    fn prepare(&self) -> CrystalResult<RecoveryScan>;

    /// Apply the truncations and removals `prepare` found necessary
    fn repair(&self, scan: &RecoveryScan) -> CrystalResult<()>;

    /// Writer for a new record of `record_type`
    fn get_writer(&self, record_type: u8) -> JournalWriter;

    /// Append the writer's payload as one record
    fn add_record(&self, writer: JournalWriter) -> CrystalResult<Waypoint>;

    /// Append a checkpoint-begin marker
    fn begin_checkpoint(&self) -> CrystalResult<CheckpointMark>;

    /// Append the matching end marker, flush, recycle covered books
    fn complete_checkpoint(&self, mark: CheckpointMark, wait: Wait) -> CrystalResult<()>;

    /// Push every appended byte to disk
    fn flush(&self, wait: Wait) -> CrystalResult<()>;

    /// Flush and stop background work
    fn close(&self) -> CrystalResult<()>;

    /// Stop background work, dropping unwritten records
    fn abort(&self);

    /// Whether records survive a restart
    fn is_durable(&self) -> bool;

    /// Unflushed journal bytes held in memory
    fn resident_bytes(&self) -> u64;

    /// Sequence and state of every tracked book, oldest first
    fn book_states(&self) -> Vec<(u64, BookState)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waypoint_order() {
        let a = Waypoint { book: 1, offset: 900 };
        let b = Waypoint { book: 2, offset: 32 };
        let c = Waypoint { book: 2, offset: 64 };
        assert!(a < b && b < c);
        assert!(!Waypoint::NONE.is_some());
        assert_eq!(c.to_string(), "2@64");
    }

    #[test]
    fn test_reserved_types() {
        assert!(is_reserved_type(CHECKPOINT_BEGIN));
        assert!(is_reserved_type(CHECKPOINT_END));
        assert!(is_reserved_type(0xFF));
        assert!(!is_reserved_type(1));
    }
}
