//! Durability layer for Crystal
//!
//! This crate owns the write-ahead journal:
//!
//! - Books: size-bounded, sequence-numbered journal files
//! - Records: typed, checksummed frames of at most 16 KiB
//! - Checkpoints: markers bracketing a full save, used to pick replay start
//!   and to recycle old books
//! - Recovery: read-only book scanning, replay selection, and torn-tail
//!   truncation once the caller accepts the scan
//! - No-op journal for configurations without durability

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod file_journal;
pub mod format;
pub mod journal;
pub mod null_journal;
pub mod recovery;
pub mod writer;

pub use config::{JournalConfig, JournalConfigError};
pub use file_journal::FileJournal;
pub use journal::{
    is_reserved_type, BookState, CheckpointMark, Journal, JournalRecord, Waypoint,
    CHECKPOINT_BEGIN, CHECKPOINT_END,
};
pub use null_journal::NullJournal;
pub use recovery::{BookRepair, RecoveryScan, ScanStop, ScannedBook};
pub use writer::JournalWriter;
