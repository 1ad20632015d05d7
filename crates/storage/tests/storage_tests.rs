//! Integration tests for the storage layer
//!
//! These tests drive `FileStorage` and `NullStorage` through the public
//! `Storage` trait:
//! - Put/get round trip for arbitrary payloads
//! - Idempotent deletion
//! - Restart with and without the check file
//! - Concurrent writers on distinct handles

use std::sync::{Arc, Barrier};
use std::thread;

use crystal_core::{result_code, BufferPool, CrystalError, FileId, ResultCode, SharedBuffer, Wait};
use crystal_storage::{
    FileStorage, FilerConfig, NullStorage, Storage, StorageCheck, StorageConfig, CHECK_FILE_NAME,
};
use proptest::prelude::*;
use rand::Rng;
use tempfile::tempdir;

// ============================================================================
// Helper Functions
// ============================================================================

fn open(dir: &std::path::Path, create_new: bool) -> FileStorage {
    let store = FileStorage::new(
        dir,
        &FilerConfig::for_testing(),
        StorageConfig::default(),
        BufferPool::new(8),
    );
    store.prepare_and_check(create_new).unwrap();
    store
}

fn random_payload(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

// ============================================================================
// Basic Operations
// ============================================================================

#[test]
fn test_put_unassigned_then_get() {
    let dir = tempdir().unwrap();
    let store = open(dir.path(), true);

    let mut id = FileId(0);
    let result = store.put(&mut id, &SharedBuffer::from_vec(vec![0, 1]), Wait::Infinite);
    assert_eq!(result_code(&result), ResultCode::Success);
    assert_ne!(id.as_u64(), 0);

    let back = store.get(id, Wait::Infinite).unwrap();
    assert_eq!(&back[..], &[0, 1]);
}

#[test]
fn test_get_unassigned_is_no_data() {
    let dir = tempdir().unwrap();
    let store = open(dir.path(), true);
    assert_eq!(
        store.get(FileId::UNASSIGNED, Wait::Infinite),
        Err(CrystalError::NoData)
    );
}

#[test]
fn test_delete_is_idempotent() {
    let dir = tempdir().unwrap();
    let store = open(dir.path(), true);

    let mut id = FileId::UNASSIGNED;
    store
        .put(&mut id, &SharedBuffer::from_vec(vec![7; 32]), Wait::Infinite)
        .unwrap();
    store.delete(&mut id, Wait::Infinite).unwrap();
    assert_eq!(id, FileId::UNASSIGNED);

    // Second delete reports NoData and leaves the handle alone
    assert_eq!(store.delete(&mut id, Wait::Infinite), Err(CrystalError::NoData));
    assert_eq!(id, FileId::UNASSIGNED);
}

#[test]
fn test_empty_payload() {
    let dir = tempdir().unwrap();
    let store = open(dir.path(), true);

    let mut id = FileId::UNASSIGNED;
    store
        .put(&mut id, &SharedBuffer::empty(), Wait::Infinite)
        .unwrap();
    assert!(store.get(id, Wait::Infinite).unwrap().is_empty());
}

#[test]
fn test_no_wait_put_lands_after_flush() {
    let dir = tempdir().unwrap();
    let store = open(dir.path(), true);

    let payload = random_payload(4096);
    let mut id = FileId::UNASSIGNED;
    store
        .put(&mut id, &SharedBuffer::from_vec(payload.clone()), Wait::NoWait)
        .unwrap();
    assert!(id.is_assigned());

    store.flush(Wait::Infinite).unwrap();
    assert_eq!(&store.get(id, Wait::Infinite).unwrap()[..], &payload[..]);
}

// ============================================================================
// Restart
// ============================================================================

#[test]
fn test_reopen_reads_previous_objects() {
    let dir = tempdir().unwrap();
    let payload = random_payload(1000);
    let mut id = FileId::UNASSIGNED;
    {
        let store = open(dir.path(), true);
        store
            .put(&mut id, &SharedBuffer::from_vec(payload.clone()), Wait::Infinite)
            .unwrap();
        store.set_root(id, Wait::Infinite).unwrap();
        store.close().unwrap();
    }

    let store = open(dir.path(), false);
    assert_eq!(store.root(), id);
    assert_eq!(&store.get(id, Wait::Infinite).unwrap()[..], &payload[..]);
}

#[test]
fn test_missing_check_file_never_reuses_ids() {
    let dir = tempdir().unwrap();
    let mut ids = Vec::new();
    {
        let store = open(dir.path(), true);
        for i in 0..5u8 {
            let mut id = FileId::UNASSIGNED;
            store
                .put(&mut id, &SharedBuffer::from_vec(vec![i]), Wait::Infinite)
                .unwrap();
            ids.push(id);
        }
        store.close().unwrap();
    }
    std::fs::remove_file(dir.path().join(CHECK_FILE_NAME)).unwrap();

    let store = FileStorage::new(
        dir.path(),
        &FilerConfig::for_testing(),
        StorageConfig::default(),
        BufferPool::new(8),
    );
    let check = store.prepare_and_check(false).unwrap();
    assert_eq!(
        check,
        StorageCheck::CheckFileMissing {
            recovered_next_id: ids[4].as_u64() + 1,
            object_count: 5,
        }
    );
    assert!(!store.root().is_assigned());

    let mut fresh = FileId::UNASSIGNED;
    store
        .put(&mut fresh, &SharedBuffer::from_vec(vec![99]), Wait::Infinite)
        .unwrap();
    assert!(!ids.contains(&fresh));
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(&store.get(*id, Wait::Infinite).unwrap()[..], &[i as u8]);
    }
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_writers_distinct_handles() {
    let dir = tempdir().unwrap();
    let store = Arc::new(open(dir.path(), true));
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4u8)
        .map(|t| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut written = Vec::new();
                for i in 0..20u8 {
                    let mut id = FileId::UNASSIGNED;
                    let data = vec![t, i];
                    store
                        .put(&mut id, &SharedBuffer::from_vec(data.clone()), Wait::Infinite)
                        .unwrap();
                    written.push((id, data));
                }
                written
            })
        })
        .collect();

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.join().unwrap());
    }

    let mut ids: Vec<u64> = all.iter().map(|(id, _)| id.as_u64()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 80, "allocated ids must be unique");

    for (id, data) in all {
        assert_eq!(&store.get(id, Wait::Infinite).unwrap()[..], &data[..]);
    }
}

// ============================================================================
// Null Backend
// ============================================================================

#[test]
fn test_null_storage_accepts_and_forgets() {
    let store = NullStorage::new();
    store.prepare_and_check(false).unwrap();

    let mut id = FileId::UNASSIGNED;
    let result = store.put(&mut id, &SharedBuffer::from_vec(vec![1, 2]), Wait::Infinite);
    assert_eq!(result_code(&result), ResultCode::Success);

    let back = store.get(id, Wait::Infinite);
    assert_eq!(result_code(&back), ResultCode::Success);
    assert!(back.unwrap().is_empty());
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_put_get_returns_written_bytes(payload in proptest::collection::vec(any::<u8>(), 0..8192)) {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), true);

        let mut id = FileId::UNASSIGNED;
        store.put(&mut id, &SharedBuffer::from_vec(payload.clone()), Wait::Infinite).unwrap();
        prop_assert!(id.is_assigned());
        let back = store.get(id, Wait::Infinite).unwrap();
        prop_assert_eq!(&back[..], &payload[..]);
    }
}
