//! On-disk byte formats for the journal.
//!
//! Keeping serialization separate from book management makes format
//! evolution easier to manage.
//!
//! # Module Structure
//!
//! - `book`: book file naming and the 32-byte book header
//! - `record`: record framing and checksum verification

pub mod book;
pub mod record;

pub use book::{
    book_file_name, parse_book_file_name, BookHeader, BookHeaderError, BOOK_FORMAT_VERSION,
    BOOK_HEADER_SIZE, BOOK_MAGIC, BOOK_PATTERN,
};
pub use record::{
    decode_frame, encode_frame, Frame, RecordError, FRAME_HEADER_SIZE, FRAME_OVERHEAD,
    FRAME_TRAILER_SIZE,
};
