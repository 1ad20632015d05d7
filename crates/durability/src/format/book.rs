//! Book file naming and header.
//!
//! Books are named `book-NNNNNN.book` where `NNNNNN` is a zero-padded
//! sequence number.
//!
//! # Book Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Book Header (32 bytes)             │
//! ├────────────────────────────────────┤
//! │ Record 1                           │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! └────────────────────────────────────┘
//! ```
//!
//! # Header Layout
//!
//! ```text
//! ┌──────────┬─────────────┬──────────────┬───────────────────┐
//! │ "CBOK"(4)│ version (4) │ sequence (8) │ store uuid (16)   │
//! └──────────┴─────────────┴──────────────┴───────────────────┘
//! ```

use byteorder::{ByteOrder, LittleEndian};

/// Magic bytes identifying a book file: "CBOK"
pub const BOOK_MAGIC: [u8; 4] = *b"CBOK";

/// Current book format version
pub const BOOK_FORMAT_VERSION: u32 = 1;

/// Size of the book header in bytes
pub const BOOK_HEADER_SIZE: usize = 32;

/// Listing pattern matching every book file
pub const BOOK_PATTERN: &str = "book-*.book";

/// File name of the book with `sequence`
pub fn book_file_name(sequence: u64) -> String {
    format!("book-{:06}.book", sequence)
}

/// Sequence number encoded in a book file name
pub fn parse_book_file_name(name: &str) -> Option<u64> {
    name.strip_prefix("book-")?
        .strip_suffix(".book")?
        .parse()
        .ok()
}

/// Book header (32 bytes).
///
/// Written at the start of every book; ties the book to its store and to its
/// place in the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookHeader {
    /// Format version
    pub format_version: u32,
    /// Book sequence number (monotonically increasing)
    pub sequence: u64,
    /// Store UUID, identical across all books of one journal
    pub store_uuid: [u8; 16],
}

impl BookHeader {
    /// Create a header for the current format version.
    pub fn new(sequence: u64, store_uuid: [u8; 16]) -> Self {
        BookHeader {
            format_version: BOOK_FORMAT_VERSION,
            sequence,
            store_uuid,
        }
    }

    /// Serialize header to bytes.
    pub fn to_bytes(&self) -> [u8; BOOK_HEADER_SIZE] {
        let mut bytes = [0u8; BOOK_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&BOOK_MAGIC);
        LittleEndian::write_u32(&mut bytes[4..8], self.format_version);
        LittleEndian::write_u64(&mut bytes[8..16], self.sequence);
        bytes[16..32].copy_from_slice(&self.store_uuid);
        bytes
    }

    /// Deserialize header from the start of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BookHeaderError> {
        if bytes.len() < BOOK_HEADER_SIZE {
            return Err(BookHeaderError::Truncated(bytes.len()));
        }
        if bytes[0..4] != BOOK_MAGIC {
            return Err(BookHeaderError::BadMagic);
        }
        let format_version = LittleEndian::read_u32(&bytes[4..8]);
        if format_version != BOOK_FORMAT_VERSION {
            return Err(BookHeaderError::UnsupportedVersion(format_version));
        }
        let mut store_uuid = [0u8; 16];
        store_uuid.copy_from_slice(&bytes[16..32]);
        Ok(BookHeader {
            format_version,
            sequence: LittleEndian::read_u64(&bytes[8..16]),
            store_uuid,
        })
    }
}

/// Book header errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BookHeaderError {
    /// Fewer bytes than a header
    #[error("Book header truncated to {0} bytes")]
    Truncated(usize),

    /// Magic bytes do not match
    #[error("Invalid book magic")]
    BadMagic,

    /// Unknown version
    #[error("Unsupported book format version: {0}")]
    UnsupportedVersion(u32),
}
