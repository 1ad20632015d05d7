//! Book scanning for recovery and replay.
//!
//! `scan_book` decodes one book's bytes; `RecoveryScan` collects the books
//! of a journal in sequence order and answers which records must be replayed.

use crate::format::{decode_frame, BookHeader, RecordError, BOOK_HEADER_SIZE};
use crate::journal::{
    is_reserved_type, JournalRecord, Waypoint, CHECKPOINT_BEGIN, CHECKPOINT_END,
};
use byteorder::{ByteOrder, LittleEndian};
use crystal_core::BufferPool;
use rustc_hash::FxHashMap;
use std::path::PathBuf;

/// Why scanning a book stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStop {
    /// Every byte decoded into records
    EndOfData,
    /// Partial record at the end (expected after a crash)
    TornTail {
        /// Offset of the partial record
        offset: u64,
    },
    /// A record failed its checksum or length check
    Corrupt {
        /// Offset of the bad record
        offset: u64,
        /// Decoder message
        detail: String,
    },
    /// Header missing or invalid; no records were read
    BadHeader(String),
}

impl ScanStop {
    /// Whether the whole file decoded
    pub fn is_clean(&self) -> bool {
        matches!(self, ScanStop::EndOfData)
    }
}

/// Result of decoding one book
#[derive(Debug, Clone)]
pub struct BookScan {
    /// Header, when valid
    pub header: Option<BookHeader>,
    /// Records in file order
    pub records: Vec<JournalRecord>,
    /// Length of the valid prefix (header plus whole records)
    pub valid_len: u64,
    /// Why decoding stopped
    pub stop: ScanStop,
}

/// Decode the bytes of book `sequence`.
///
/// Payloads are copied into pooled buffers so the file bytes can be dropped.
pub fn scan_book(sequence: u64, bytes: &[u8], pool: &BufferPool) -> BookScan {
    let header = match BookHeader::from_bytes(bytes) {
        Ok(header) => header,
        Err(e) => {
            return BookScan {
                header: None,
                records: Vec::new(),
                valid_len: 0,
                stop: ScanStop::BadHeader(e.to_string()),
            }
        }
    };

    let mut records = Vec::new();
    let mut offset = BOOK_HEADER_SIZE;
    let mut stop = ScanStop::EndOfData;

    while offset < bytes.len() {
        match decode_frame(&bytes[offset..]) {
            Ok((frame, used)) => {
                records.push(JournalRecord {
                    waypoint: Waypoint {
                        book: sequence,
                        offset: offset as u64,
                    },
                    record_type: frame.record_type,
                    payload: pool.copy_from(frame.payload),
                });
                offset += used;
            }
            Err(RecordError::InsufficientData) => {
                stop = ScanStop::TornTail {
                    offset: offset as u64,
                };
                break;
            }
            Err(e) => {
                stop = ScanStop::Corrupt {
                    offset: offset as u64,
                    detail: e.to_string(),
                };
                break;
            }
        }
    }

    BookScan {
        header: Some(header),
        records,
        valid_len: offset as u64,
        stop,
    }
}

/// Checkpoint-marker payload: the checkpoint number
pub(crate) fn encode_marker(number: u64) -> [u8; 8] {
    let mut bytes = [0u8; 8];
    LittleEndian::write_u64(&mut bytes, number);
    bytes
}

pub(crate) fn decode_marker(payload: &[u8]) -> Option<u64> {
    if payload.len() == 8 {
        Some(LittleEndian::read_u64(payload))
    } else {
        None
    }
}

/// One book found during `prepare`
#[derive(Debug, Clone)]
pub struct ScannedBook {
    /// Sequence number from the file name
    pub sequence: u64,
    /// Path relative to the journal directory
    pub path: PathBuf,
    /// Bytes up to the first frame that failed to decode
    pub valid_len: u64,
    /// Why decoding stopped
    pub stop: ScanStop,
}

/// Everything `prepare` learned from existing books
#[derive(Debug, Clone, Default)]
pub struct RecoveryScan {
    /// Books in sequence order
    pub books: Vec<ScannedBook>,
    /// Records of every book in journal order, markers included
    pub records: Vec<JournalRecord>,
    /// Books whose content could not be fully trusted
    pub inconsistent: Vec<PathBuf>,
    /// Changes `Journal::repair` applies to damaged books
    pub repairs: Vec<BookRepair>,
}

/// Change to one damaged book, deferred until recovery is accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookRepair {
    /// Cut the book back to its first `len` bytes
    Truncate {
        /// Path relative to the journal directory
        path: PathBuf,
        /// Bytes to keep
        len: u64,
    },
    /// Delete a book that never received its header
    Remove {
        /// Path relative to the journal directory
        path: PathBuf,
    },
}

impl RecoveryScan {
    /// Scan of a journal with no books
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether no records were found
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number and begin position of the last checkpoint that has both markers
    pub fn last_completed_checkpoint(&self) -> Option<(u64, Waypoint)> {
        let mut begins: FxHashMap<u64, Waypoint> = FxHashMap::default();
        let mut completed = None;
        for record in &self.records {
            let number = match decode_marker(&record.payload) {
                Some(n) => n,
                None => continue,
            };
            match record.record_type {
                CHECKPOINT_BEGIN => {
                    begins.insert(number, record.waypoint);
                }
                CHECKPOINT_END => {
                    if let Some(begin) = begins.get(&number) {
                        completed = Some((number, *begin));
                    }
                }
                _ => {}
            }
        }
        completed
    }

    /// Highest checkpoint number seen in any marker
    pub fn max_checkpoint(&self) -> u64 {
        self.records
            .iter()
            .filter(|r| r.record_type == CHECKPOINT_BEGIN || r.record_type == CHECKPOINT_END)
            .filter_map(|r| decode_marker(&r.payload))
            .max()
            .unwrap_or(0)
    }

    /// Records to replay, in order, markers excluded
    pub fn replay_records(&self) -> impl Iterator<Item = &JournalRecord> {
        let after = self.last_completed_checkpoint().map(|(_, begin)| begin);
        self.records.iter().filter(move |record| {
            !is_reserved_type(record.record_type)
                && after.map_or(true, |begin| record.waypoint > begin)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::encode_frame;

    fn book_bytes(sequence: u64, records: &[(u8, &[u8])]) -> Vec<u8> {
        let mut bytes = BookHeader::new(sequence, [1u8; 16]).to_bytes().to_vec();
        for (record_type, payload) in records {
            encode_frame(*record_type, payload, &mut bytes).unwrap();
        }
        bytes
    }

    fn record(book: u64, offset: u64, record_type: u8, payload: &[u8]) -> JournalRecord {
        JournalRecord {
            waypoint: Waypoint { book, offset },
            record_type,
            payload: crystal_core::SharedBuffer::from_vec(payload.to_vec()),
        }
    }

    #[test]
    fn test_scan_clean_book() {
        let pool = BufferPool::new(4);
        let bytes = book_bytes(3, &[(1, b"a"), (2, b"bb")]);
        let scan = scan_book(3, &bytes, &pool);
        assert_eq!(scan.stop, ScanStop::EndOfData);
        assert_eq!(scan.records.len(), 2);
        assert_eq!(scan.records[0].waypoint, Waypoint { book: 3, offset: 32 });
        assert_eq!(&scan.records[1].payload[..], b"bb");
        assert_eq!(scan.valid_len, bytes.len() as u64);
    }

    #[test]
    fn test_scan_torn_tail() {
        let pool = BufferPool::new(4);
        let bytes = book_bytes(1, &[(1, b"keep"), (1, b"lost")]);
        let torn = &bytes[..bytes.len() - 2];
        let scan = scan_book(1, torn, &pool);
        assert_eq!(scan.records.len(), 1);
        assert!(matches!(scan.stop, ScanStop::TornTail { .. }));
        assert_eq!(scan.valid_len, (32 + 7 + 4) as u64);
    }

    #[test]
    fn test_scan_bad_header() {
        let pool = BufferPool::new(4);
        let scan = scan_book(1, &[0u8; 40], &pool);
        assert!(scan.header.is_none());
        assert!(matches!(scan.stop, ScanStop::BadHeader(_)));
    }

    #[test]
    fn test_replay_without_checkpoint_returns_everything() {
        let scan = RecoveryScan {
            records: vec![record(1, 32, 1, b"x"), record(1, 40, 2, b"y")],
            ..RecoveryScan::default()
        };
        assert_eq!(scan.replay_records().count(), 2);
        assert_eq!(scan.last_completed_checkpoint(), None);
    }

    #[test]
    fn test_replay_starts_after_last_completed_begin() {
        let scan = RecoveryScan {
            records: vec![
                record(1, 32, 1, b"before"),
                record(1, 50, CHECKPOINT_BEGIN, &encode_marker(1)),
                record(1, 70, 1, b"during"),
                record(1, 90, CHECKPOINT_END, &encode_marker(1)),
                record(2, 32, 1, b"after"),
                // Begin without end: ignored
                record(2, 60, CHECKPOINT_BEGIN, &encode_marker(2)),
                record(2, 80, 1, b"late"),
            ],
            ..RecoveryScan::default()
        };
        let replayed: Vec<&[u8]> = scan.replay_records().map(|r| &r.payload[..]).collect();
        let expected: Vec<&[u8]> = vec![b"during", b"after", b"late"];
        assert_eq!(replayed, expected);
        assert_eq!(
            scan.last_completed_checkpoint(),
            Some((1, Waypoint { book: 1, offset: 50 }))
        );
        assert_eq!(scan.max_checkpoint(), 2);
    }
}
