//! State shared by every node of one running tree.

use crate::config::CrystallizationPolicy;
use crate::himo::Himo;
use crate::record::{self, TreeRecord};
use crate::registry::DatumRegistry;
use crystal_core::{BufferPool, CrystalError, CrystalResult, FileId, Wait};
use crystal_durability::Journal;
use crystal_storage::Storage;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Backends and settings of a started coordinator
pub(crate) struct TreeContext {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) journal: Arc<dyn Journal>,
    pub(crate) registry: Arc<DatumRegistry>,
    pub(crate) himo: Himo,
    pub(crate) pool: BufferPool,
    pub(crate) policy: CrystallizationPolicy,
    pub(crate) wait: Wait,
    /// Set while the journal is replayed; suppresses journaling and instant saves
    replaying: AtomicBool,
    /// Storage handles no longer named by the tree, deleted after the next
    /// full save
    retired: Mutex<Vec<FileId>>,
    /// Serializes full-tree saves and root pointer updates
    pub(crate) save_lock: Mutex<()>,
}

impl TreeContext {
    pub(crate) fn new(
        storage: Arc<dyn Storage>,
        journal: Arc<dyn Journal>,
        registry: Arc<DatumRegistry>,
        himo: Himo,
        pool: BufferPool,
        policy: CrystallizationPolicy,
        wait: Wait,
    ) -> Self {
        TreeContext {
            storage,
            journal,
            registry,
            himo,
            pool,
            policy,
            wait,
            replaying: AtomicBool::new(false),
            retired: Mutex::new(Vec::new()),
            save_lock: Mutex::new(()),
        }
    }

    pub(crate) fn set_replaying(&self, replaying: bool) {
        self.replaying.store(replaying, Ordering::Release);
    }

    /// Whether mutations are appended to the journal
    pub(crate) fn journaling(&self) -> bool {
        self.journal.is_durable() && !self.replaying.load(Ordering::Acquire)
    }

    /// Whether mutations are saved before they return
    pub(crate) fn saves_instantly(&self) -> bool {
        self.policy == CrystallizationPolicy::Instant && !self.replaying.load(Ordering::Acquire)
    }

    /// Append `record` when journaling is on
    pub(crate) fn journal(&self, record: &TreeRecord) -> CrystalResult<()> {
        if self.journaling() {
            record::append(self.journal.as_ref(), record)?;
        }
        Ok(())
    }

    /// Queue a storage handle for deletion once the tree no longer names it
    pub(crate) fn retire(&self, file_id: FileId) {
        if file_id.is_assigned() {
            self.retired.lock().push(file_id);
        }
    }

    /// Handles retired so far.
    ///
    /// Every manifest that named one of them was marked dirty before it was
    /// retired, so a full save started after this call stops naming them.
    pub(crate) fn take_retired(&self) -> Vec<FileId> {
        std::mem::take(&mut *self.retired.lock())
    }

    /// Put back handles whose save did not complete
    pub(crate) fn restore_retired(&self, mut file_ids: Vec<FileId>) {
        let mut retired = self.retired.lock();
        file_ids.append(&mut retired);
        *retired = file_ids;
    }

    /// Delete `file_ids`; failures are logged and dropped
    pub(crate) fn purge(&self, file_ids: Vec<FileId>) {
        for mut file_id in file_ids {
            let id = file_id;
            match self.storage.delete(&mut file_id, self.wait) {
                Ok(()) | Err(CrystalError::NoData) => {}
                Err(e) => warn!(file_id = %id, error = %e, "Failed to delete retired object"),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }

    /// Context over prepared no-op backends
    #[cfg(test)]
    pub(crate) fn in_memory(registry: DatumRegistry) -> Arc<Self> {
        use crystal_storage::NullStorage;

        let storage = NullStorage::new();
        storage
            .prepare_and_check(true)
            .expect("null storage prepares");
        Self::over_storage(Arc::new(storage), registry)
    }

    /// Context over a prepared `storage` and a no-op journal
    #[cfg(test)]
    pub(crate) fn over_storage(storage: Arc<dyn Storage>, registry: DatumRegistry) -> Arc<Self> {
        use crate::config::HimoConfig;
        use crystal_durability::NullJournal;

        Arc::new(TreeContext::new(
            storage,
            Arc::new(NullJournal::default()),
            Arc::new(registry),
            Himo::new(&HimoConfig::default()),
            BufferPool::new(8),
            CrystallizationPolicy::None,
            Wait::Infinite,
        ))
    }
}
