//! Storage abstraction
//!
//! A [`Storage`] maps opaque [`FileId`] handles onto physical payloads. Two
//! backends exist:
//!
//! - [`FileStorage`](crate::FileStorage): one object file per handle, written
//!   through a [`Filer`](crate::Filer)
//! - [`NullStorage`](crate::NullStorage): accepts everything, stores nothing
//!
//! The backend is chosen from configuration when the coordinator starts.

use crystal_core::{CrystalResult, FileId, SharedBuffer, Wait};

/// Outcome of preparing a storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageCheck {
    /// A new, empty store was initialized
    Created,
    /// An existing store was opened
    Resumed,
    /// Objects exist but the check file is missing or unreadable; the
    /// allocator was rebuilt from the object files
    CheckFileMissing {
        /// Next id chosen after scanning object files
        recovered_next_id: u64,
        /// Object files found; none is reachable from the reset root
        object_count: u64,
    },
}

/// Handle-addressed payload storage
///
/// # Contract
///
/// - `put` with an unassigned handle allocates one and writes it back
/// - `get` of an unassigned handle reports `NoData`
/// - `delete` resets the handle to unassigned; deleting an unassigned handle
///   reports `NoData` and changes nothing
/// - No method panics for I/O failure; failures surface as `CrystalError`
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; handles are independent, so
/// concurrent calls on different handles never serialize on a global lock.
pub trait Storage: Send + Sync {
    /// Initialize the backend; `create_new` discards any existing data
    fn prepare_and_check(&self, create_new: bool) -> CrystalResult<StorageCheck>;

    /// Write `data` under `file_id`, allocating the handle when unassigned.
    ///
    /// Rewriting an assigned handle replaces the object in place and is not
    /// atomic; callers that need the old payload to survive a crash write to
    /// a fresh handle instead.
    fn put(&self, file_id: &mut FileId, data: &SharedBuffer, wait: Wait) -> CrystalResult<()>;

    /// Read the payload stored under `file_id`
    fn get(&self, file_id: FileId, wait: Wait) -> CrystalResult<SharedBuffer>;

    /// Remove the payload under `file_id` and reset the handle
    fn delete(&self, file_id: &mut FileId, wait: Wait) -> CrystalResult<()>;

    /// Handle of the root manifest
    fn root(&self) -> FileId;

    /// Persist the root manifest handle
    fn set_root(&self, root: FileId, wait: Wait) -> CrystalResult<()>;

    /// Wait for all queued writes to reach the backend
    fn flush(&self, wait: Wait) -> CrystalResult<()>;

    /// Flush bookkeeping and stop background work
    fn close(&self) -> CrystalResult<()>;

    /// Stop background work without flushing
    fn abort(&self);

    /// Whether data survives a restart
    fn is_persistent(&self) -> bool;

    /// Largest payload `put` accepts
    fn max_object_size(&self) -> usize;

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}
