//! Journal records of tree mutations
//!
//! Each record names its node by the path of child names below the root.
//!
//! # Payload Layout
//!
//! ```text
//! ┌──────────────────────────────┬───────────────────────────┐
//! │ MessagePack header           │ Raw datum bytes           │
//! │ (path, tag, file id)         │ (DatumWrite only)         │
//! └──────────────────────────────┴───────────────────────────┘
//! ```
//!
//! Replaying a record twice leaves the tree as replaying it once.

use crystal_core::{BufferPool, CrystalError, CrystalResult, DatumTag, FileId, SharedBuffer};
use crystal_durability::{Journal, JournalWriter, Waypoint};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Write};

/// Child created
pub const NODE_CREATE: u8 = 0x01;
/// Child deleted, with its subtree
pub const NODE_DELETE: u8 = 0x02;
/// Unit content replaced by the trailing bytes
pub const DATUM_WRITE: u8 = 0x03;
/// Unit deleted
pub const DATUM_DELETE: u8 = 0x04;
/// Unit content stored directly under a file id
pub const DATUM_BIND: u8 = 0x05;

/// One journaled mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeRecord {
    /// `get_or_create_child` created the last path element
    NodeCreate {
        /// Names from the root to the new node
        path: Vec<String>,
    },
    /// The last path element was deleted
    NodeDelete {
        /// Names from the root to the deleted node
        path: Vec<String>,
    },
    /// Unit content written
    DatumWrite {
        /// Node path
        path: Vec<String>,
        /// Unit tag
        tag: DatumTag,
        /// Encoded content
        bytes: SharedBuffer,
    },
    /// Unit deleted
    DatumDelete {
        /// Node path
        path: Vec<String>,
        /// Unit tag
        tag: DatumTag,
    },
    /// Unit content too large for a record, already in storage
    DatumBind {
        /// Node path
        path: Vec<String>,
        /// Unit tag
        tag: DatumTag,
        /// Storage handle holding the content
        file_id: FileId,
    },
}

#[derive(Serialize, Deserialize)]
struct PathHeader<P> {
    path: P,
}

#[derive(Serialize, Deserialize)]
struct DatumHeader<P> {
    path: P,
    tag: u8,
}

#[derive(Serialize, Deserialize)]
struct BindHeader<P> {
    path: P,
    tag: u8,
    file_id: u64,
}

impl TreeRecord {
    /// Journal record type
    pub fn record_type(&self) -> u8 {
        match self {
            TreeRecord::NodeCreate { .. } => NODE_CREATE,
            TreeRecord::NodeDelete { .. } => NODE_DELETE,
            TreeRecord::DatumWrite { .. } => DATUM_WRITE,
            TreeRecord::DatumDelete { .. } => DATUM_DELETE,
            TreeRecord::DatumBind { .. } => DATUM_BIND,
        }
    }

    /// Path of the node the record applies to
    pub fn path(&self) -> &[String] {
        match self {
            TreeRecord::NodeCreate { path }
            | TreeRecord::NodeDelete { path }
            | TreeRecord::DatumWrite { path, .. }
            | TreeRecord::DatumDelete { path, .. }
            | TreeRecord::DatumBind { path, .. } => path,
        }
    }

    /// Encode the payload into `out`
    pub fn write_to<W: Write>(&self, out: &mut W) -> CrystalResult<()> {
        match self {
            TreeRecord::NodeCreate { path } | TreeRecord::NodeDelete { path } => {
                write_header(out, &PathHeader { path: &path[..] })
            }
            TreeRecord::DatumWrite { path, tag, bytes } => {
                write_header(
                    out,
                    &DatumHeader {
                        path: &path[..],
                        tag: tag.as_u8(),
                    },
                )?;
                out.write_all(bytes)?;
                Ok(())
            }
            TreeRecord::DatumDelete { path, tag } => write_header(
                out,
                &DatumHeader {
                    path: &path[..],
                    tag: tag.as_u8(),
                },
            ),
            TreeRecord::DatumBind { path, tag, file_id } => write_header(
                out,
                &BindHeader {
                    path: &path[..],
                    tag: tag.as_u8(),
                    file_id: file_id.as_u64(),
                },
            ),
        }
    }

    /// Encode into a fresh writer of `journal`; the caller checks the size
    pub fn to_writer(&self, journal: &dyn Journal) -> CrystalResult<JournalWriter> {
        let mut writer = journal.get_writer(self.record_type());
        self.write_to(&mut writer)?;
        Ok(writer)
    }

    /// Decode a payload read back from the journal
    pub fn decode(record_type: u8, payload: &[u8], pool: &BufferPool) -> CrystalResult<Self> {
        let mut cursor = Cursor::new(payload);
        match record_type {
            NODE_CREATE => {
                let header: PathHeader<Vec<String>> = read_header(&mut cursor)?;
                Ok(TreeRecord::NodeCreate { path: header.path })
            }
            NODE_DELETE => {
                let header: PathHeader<Vec<String>> = read_header(&mut cursor)?;
                Ok(TreeRecord::NodeDelete { path: header.path })
            }
            DATUM_WRITE => {
                let header: DatumHeader<Vec<String>> = read_header(&mut cursor)?;
                let start = cursor.position() as usize;
                Ok(TreeRecord::DatumWrite {
                    path: header.path,
                    tag: DatumTag(header.tag),
                    bytes: pool.copy_from(&payload[start..]),
                })
            }
            DATUM_DELETE => {
                let header: DatumHeader<Vec<String>> = read_header(&mut cursor)?;
                Ok(TreeRecord::DatumDelete {
                    path: header.path,
                    tag: DatumTag(header.tag),
                })
            }
            DATUM_BIND => {
                let header: BindHeader<Vec<String>> = read_header(&mut cursor)?;
                Ok(TreeRecord::DatumBind {
                    path: header.path,
                    tag: DatumTag(header.tag),
                    file_id: FileId(header.file_id),
                })
            }
            other => Err(CrystalError::deserialize(format!(
                "unknown journal record type {:#04x}",
                other
            ))),
        }
    }
}

/// Encode `record` and append it to `journal`
pub(crate) fn append(journal: &dyn Journal, record: &TreeRecord) -> CrystalResult<Waypoint> {
    let writer = record.to_writer(journal)?;
    journal.add_record(writer)
}

fn write_header<W: Write, T: Serialize>(out: &mut W, header: &T) -> CrystalResult<()> {
    rmp_serde::encode::write(out, header)
        .map_err(|e| CrystalError::invalid_argument(format!("record encode failed: {}", e)))
}

fn read_header<T: DeserializeOwned>(cursor: &mut Cursor<&[u8]>) -> CrystalResult<T> {
    rmp_serde::decode::from_read(&mut *cursor)
        .map_err(|e| CrystalError::deserialize(format!("record header: {}", e)))
}
