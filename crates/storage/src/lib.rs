//! Storage layer for Crystal
//!
//! This crate turns opaque file handles into bytes on disk:
//! - Filer: queued byte-range I/O over a pluggable backend, one worker thread
//! - Storage: handle-addressed objects (`FileStorage`) or nothing (`NullStorage`)
//! - Check file: allocator high-water mark and root manifest handle
//! - Config: filer and storage settings

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod check_file;
pub mod config;
pub mod file_store;
pub mod filer;
pub mod null_store;
pub mod store;

pub use check_file::{CheckFile, CheckFileError, CHECK_FILE_NAME};
pub use config::{FilerConfig, StorageConfig, StorageConfigError, MAX_FRAMED_OBJECT_SIZE};
pub use file_store::FileStorage;
pub use filer::{Filer, FilerBackend, FilerCounters, FilerTicket, LocalFileBackend, TO_END};
pub use null_store::NullStorage;
pub use store::{Storage, StorageCheck};
