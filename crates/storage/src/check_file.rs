//! Storage check file format.
//!
//! `crystal.check` sits at the root of a storage directory and records the
//! allocator high-water mark and the root manifest handle.
//!
//! # Layout (32 bytes)
//!
//! ```text
//! ┌──────────┬─────────────┬─────────────┬─────────────┬──────────┬──────────┐
//! │ "CRYS"(4)│ version (4) │ next id (8) │ root id (8) │ rsvd (4) │ CRC32 (4)│
//! └──────────┴─────────────┴─────────────┴─────────────┴──────────┴──────────┘
//! ```

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use crystal_core::FileId;

/// File name of the check file.
pub const CHECK_FILE_NAME: &str = "crystal.check";

/// Magic bytes of the check file.
pub const CHECK_MAGIC: [u8; 4] = *b"CRYS";

/// Current check file version.
pub const CHECK_FORMAT_VERSION: u32 = 1;

/// Size of the check file in bytes.
pub const CHECK_FILE_SIZE: usize = 32;

/// Decoded check file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckFile {
    /// Next file id the allocator hands out.
    pub next_id: u64,
    /// Handle of the root manifest, unassigned for an empty store.
    pub root: FileId,
}

impl CheckFile {
    /// Check file of an empty store.
    pub fn fresh() -> Self {
        CheckFile {
            next_id: 1,
            root: FileId::UNASSIGNED,
        }
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> [u8; CHECK_FILE_SIZE] {
        let mut bytes = [0u8; CHECK_FILE_SIZE];
        bytes[0..4].copy_from_slice(&CHECK_MAGIC);
        LittleEndian::write_u32(&mut bytes[4..8], CHECK_FORMAT_VERSION);
        LittleEndian::write_u64(&mut bytes[8..16], self.next_id);
        LittleEndian::write_u64(&mut bytes[16..24], self.root.as_u64());
        let crc = compute_crc(&bytes[..28]);
        LittleEndian::write_u32(&mut bytes[28..32], crc);
        bytes
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CheckFileError> {
        if bytes.len() < CHECK_FILE_SIZE {
            return Err(CheckFileError::Truncated(bytes.len()));
        }
        if bytes[0..4] != CHECK_MAGIC {
            return Err(CheckFileError::BadMagic);
        }
        let version = LittleEndian::read_u32(&bytes[4..8]);
        if version != CHECK_FORMAT_VERSION {
            return Err(CheckFileError::UnsupportedVersion(version));
        }
        let stored = LittleEndian::read_u32(&bytes[28..32]);
        let computed = compute_crc(&bytes[..28]);
        if stored != computed {
            return Err(CheckFileError::ChecksumMismatch { stored, computed });
        }
        Ok(CheckFile {
            next_id: LittleEndian::read_u64(&bytes[8..16]),
            root: FileId(LittleEndian::read_u64(&bytes[16..24])),
        })
    }
}

fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Check file parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckFileError {
    /// File shorter than the fixed layout.
    #[error("Check file truncated to {0} bytes")]
    Truncated(usize),

    /// Magic bytes do not match.
    #[error("Invalid check file magic")]
    BadMagic,

    /// Unknown version.
    #[error("Unsupported check file version: {0}")]
    UnsupportedVersion(u32),

    /// CRC mismatch.
    #[error("Check file checksum mismatch: stored {stored:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// CRC stored in the file
        stored: u32,
        /// CRC of the content
        computed: u32,
    },
}
