//! Journal record framing.
//!
//! # Frame Layout
//!
//! ```text
//! ┌──────────────┬──────────────────┬─────────────────────────┬──────────┐
//! │ Type (1 byte)│ Length (2 bytes) │ Payload (≤ 16 KiB)      │ CRC32 (4)│
//! └──────────────┴──────────────────┴─────────────────────────┴──────────┘
//! ```
//!
//! The CRC covers type, length and payload.

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use crystal_core::limits::MAX_RECORD_PAYLOAD;
use std::io::{self, Write};

/// Bytes before the payload
pub const FRAME_HEADER_SIZE: usize = 3;

/// Bytes after the payload
pub const FRAME_TRAILER_SIZE: usize = 4;

/// Framing overhead per record
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + FRAME_TRAILER_SIZE;

/// A decoded frame borrowing its payload from the scanned bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Record type tag
    pub record_type: u8,
    /// Record payload
    pub payload: &'a [u8],
}

/// Append one framed record to `out`.
///
/// The caller enforces the payload limit before framing.
pub fn encode_frame<W: Write + ?Sized>(
    record_type: u8,
    payload: &[u8],
    out: &mut W,
) -> io::Result<()> {
    debug_assert!(payload.len() <= MAX_RECORD_PAYLOAD);
    let mut header = [0u8; FRAME_HEADER_SIZE];
    header[0] = record_type;
    LittleEndian::write_u16(&mut header[1..3], payload.len() as u16);

    let mut hasher = Hasher::new();
    hasher.update(&header);
    hasher.update(payload);
    let crc = hasher.finalize();

    out.write_all(&header)?;
    out.write_all(payload)?;
    out.write_all(&crc.to_le_bytes())
}

/// Decode the frame at the start of `bytes`.
///
/// Returns the frame and the number of bytes it occupies.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame<'_>, usize), RecordError> {
    if bytes.len() < FRAME_HEADER_SIZE {
        return Err(RecordError::InsufficientData);
    }
    let record_type = bytes[0];
    let length = LittleEndian::read_u16(&bytes[1..3]) as usize;
    if length > MAX_RECORD_PAYLOAD {
        return Err(RecordError::LengthTooLarge(length));
    }
    let total = FRAME_OVERHEAD + length;
    if bytes.len() < total {
        return Err(RecordError::InsufficientData);
    }

    let body_end = FRAME_HEADER_SIZE + length;
    let stored = LittleEndian::read_u32(&bytes[body_end..total]);
    let mut hasher = Hasher::new();
    hasher.update(&bytes[..body_end]);
    let computed = hasher.finalize();
    if stored != computed {
        return Err(RecordError::ChecksumMismatch {
            expected: stored,
            computed,
        });
    }

    Ok((
        Frame {
            record_type,
            payload: &bytes[FRAME_HEADER_SIZE..body_end],
        },
        total,
    ))
}

/// Record parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// Not enough data to parse record
    #[error("Insufficient data to parse record")]
    InsufficientData,

    /// Length field exceeds the payload limit
    #[error("Record length {0} exceeds the payload limit")]
    LengthTooLarge(usize),

    /// Checksum verification failed
    #[error("Checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Expected checksum from record
        expected: u32,
        /// Computed checksum
        computed: u32,
    },
}
