//! Core types for Crystal
//!
//! This crate defines the foundational pieces every other layer depends on:
//! - Buffer pool: size-classed, reference-counted byte buffers
//! - Identifier, FileId, DatumTag: keys and handles
//! - Wait: caller suspension policy for queued I/O
//! - Error: `CrystalError` and the enumerated `ResultCode`
//! - Limits: journal and object size bounds

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod error;
pub mod limits;
pub mod types;
pub mod wait;

pub use buffer::{BufferOwner, BufferPool, PoolStats, SharedBuffer};
pub use error::{result_code, CrystalError, CrystalResult, ResultCode};
pub use types::{DatumTag, FileId, Identifier};
pub use wait::Wait;
