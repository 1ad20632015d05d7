//! No-op storage backend
//!
//! Used when crystallization is disabled: every write succeeds and nothing
//! is kept.

use crate::store::{Storage, StorageCheck};
use crystal_core::{CrystalError, CrystalResult, FileId, SharedBuffer, Wait};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Storage that stores nothing
#[derive(Debug)]
pub struct NullStorage {
    prepared: AtomicBool,
    next_id: AtomicU64,
}

impl NullStorage {
    /// Create an unprepared null backend
    pub fn new() -> Self {
        NullStorage {
            prepared: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    fn ensure_ready(&self) -> CrystalResult<()> {
        if self.prepared.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CrystalError::NotStarted)
        }
    }
}

impl Default for NullStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for NullStorage {
    fn prepare_and_check(&self, _create_new: bool) -> CrystalResult<StorageCheck> {
        self.prepared.store(true, Ordering::Release);
        Ok(StorageCheck::Created)
    }

    fn put(&self, file_id: &mut FileId, _data: &SharedBuffer, _wait: Wait) -> CrystalResult<()> {
        self.ensure_ready()?;
        if !file_id.is_assigned() {
            *file_id = FileId(self.next_id.fetch_add(1, Ordering::Relaxed));
        }
        Ok(())
    }

    fn get(&self, _file_id: FileId, _wait: Wait) -> CrystalResult<SharedBuffer> {
        self.ensure_ready()?;
        Ok(SharedBuffer::empty())
    }

    fn delete(&self, file_id: &mut FileId, _wait: Wait) -> CrystalResult<()> {
        self.ensure_ready()?;
        *file_id = FileId::UNASSIGNED;
        Ok(())
    }

    fn root(&self) -> FileId {
        FileId::UNASSIGNED
    }

    fn set_root(&self, _root: FileId, _wait: Wait) -> CrystalResult<()> {
        self.ensure_ready()
    }

    fn flush(&self, _wait: Wait) -> CrystalResult<()> {
        self.ensure_ready()
    }

    fn close(&self) -> CrystalResult<()> {
        self.prepared.store(false, Ordering::Release);
        Ok(())
    }

    fn abort(&self) {
        self.prepared.store(false, Ordering::Release);
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn max_object_size(&self) -> usize {
        usize::MAX
    }

    fn backend_name(&self) -> &'static str {
        "null"
    }
}
