//! Object-file storage backend
//!
//! Every handle maps to one object file below the storage directory:
//!
//! ```text
//! <root>/crystal.check
//! <root>/objects/<id & 0xff as 2 hex>/<id as 16 hex>.obj
//! ```
//!
//! # Object Layout
//!
//! ```text
//! ┌──────────────────┬──────────────┬──────────────────────┐
//! │ Length (4 bytes) │ CRC32 (4)    │ Payload (variable)   │
//! └──────────────────┴──────────────┴──────────────────────┘
//! ```
//!
//! The payload is written first and the header last, each as its own filer
//! job sharing the caller's buffer, so a torn write leaves a header whose CRC
//! no longer matches and `get` reports `DeserializeError`. A torn rewrite of
//! an existing object loses both versions; the engine therefore writes every
//! save to a fresh handle and deletes old handles only after the root that
//! stopped referencing them is on disk.

use crate::check_file::{CheckFile, CHECK_FILE_NAME, CHECK_FILE_SIZE};
use crate::config::{FilerConfig, StorageConfig, MAX_FRAMED_OBJECT_SIZE};
use crate::filer::{Filer, TO_END};
use crate::store::{Storage, StorageCheck};
use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use crystal_core::{BufferPool, CrystalError, CrystalResult, FileId, SharedBuffer, Wait};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Size of the per-object header
pub const OBJECT_HEADER_SIZE: u64 = 8;

const OBJECT_DIR: &str = "objects";
const OBJECT_SUFFIX: &str = ".obj";

/// Storage backend keeping one file per handle
pub struct FileStorage {
    filer: Filer,
    config: StorageConfig,
    pool: BufferPool,
    next_id: AtomicU64,
    root: AtomicU64,
}

impl FileStorage {
    /// Create a backend rooted at `root_dir`; nothing touches disk until
    /// `prepare_and_check`
    pub fn new(
        root_dir: impl Into<PathBuf>,
        filer_config: &FilerConfig,
        config: StorageConfig,
        pool: BufferPool,
    ) -> Self {
        FileStorage {
            filer: Filer::local("storage", root_dir, filer_config.sync_writes, pool.clone()),
            config,
            pool,
            next_id: AtomicU64::new(1),
            root: AtomicU64::new(0),
        }
    }

    /// Path of the object file for `id`, relative to the storage root
    pub fn object_path(id: FileId) -> PathBuf {
        let raw = id.as_u64();
        PathBuf::from(OBJECT_DIR)
            .join(format!("{:02x}", raw & 0xff))
            .join(format!("{:016x}{}", raw, OBJECT_SUFFIX))
    }

    /// Parse an object path back into its handle
    pub fn parse_object_path(path: &std::path::Path) -> Option<FileId> {
        let name = path.file_name()?.to_str()?;
        let hex = name.strip_suffix(OBJECT_SUFFIX)?;
        u64::from_str_radix(hex, 16).ok().map(FileId)
    }

    /// Underlying filer (exposed for diagnostics)
    pub fn filer(&self) -> &Filer {
        &self.filer
    }

    fn ensure_ready(&self) -> CrystalResult<()> {
        if self.filer.is_ready() {
            Ok(())
        } else {
            Err(CrystalError::NotStarted)
        }
    }

    fn current_check(&self) -> CheckFile {
        CheckFile {
            next_id: self.next_id.load(Ordering::Acquire),
            root: FileId(self.root.load(Ordering::Acquire)),
        }
    }

    fn write_check(&self, wait: Wait) -> CrystalResult<()> {
        let bytes = self.current_check().to_bytes();
        self.filer
            .write_wait(CHECK_FILE_NAME, 0, self.pool.copy_from(&bytes), wait)
    }

    /// Highest object id on disk and the number of object files
    fn scan_objects(&self) -> CrystalResult<(u64, u64)> {
        let files = self.filer.list_files(&format!("*{}", OBJECT_SUFFIX))?;
        let mut max = 0;
        let mut count = 0;
        for id in files.iter().filter_map(|p| Self::parse_object_path(p)) {
            max = max.max(id.as_u64());
            count += 1;
        }
        Ok((max, count))
    }

    fn frame_header(data: &[u8]) -> CrystalResult<[u8; OBJECT_HEADER_SIZE as usize]> {
        let len = u32::try_from(data.len()).map_err(|_| CrystalError::OverSizeLimit {
            size: data.len(),
            limit: MAX_FRAMED_OBJECT_SIZE,
        })?;
        let mut hasher = Hasher::new();
        hasher.update(data);
        let mut header = [0u8; OBJECT_HEADER_SIZE as usize];
        LittleEndian::write_u32(&mut header[0..4], len);
        LittleEndian::write_u32(&mut header[4..8], hasher.finalize());
        Ok(header)
    }

    fn unframe(&self, id: FileId, raw: &SharedBuffer) -> CrystalResult<SharedBuffer> {
        let header = OBJECT_HEADER_SIZE as usize;
        if raw.len() < header {
            return Err(CrystalError::deserialize(format!(
                "object {} truncated: {} bytes",
                id,
                raw.len()
            )));
        }
        let len = LittleEndian::read_u32(&raw[0..4]) as usize;
        let stored_crc = LittleEndian::read_u32(&raw[4..8]);
        if raw.len() < header + len {
            return Err(CrystalError::deserialize(format!(
                "object {} truncated: header says {} bytes, found {}",
                id,
                len,
                raw.len() - header
            )));
        }
        let payload = &raw[header..header + len];
        let mut hasher = Hasher::new();
        hasher.update(payload);
        let computed = hasher.finalize();
        if computed != stored_crc {
            return Err(CrystalError::deserialize(format!(
                "object {} checksum mismatch: stored {:08x}, computed {:08x}",
                id, stored_crc, computed
            )));
        }
        Ok(self.pool.copy_from(payload))
    }
}

impl Storage for FileStorage {
    fn prepare_and_check(&self, create_new: bool) -> CrystalResult<StorageCheck> {
        self.config
            .validate()
            .map_err(|e| CrystalError::invalid_argument(e.to_string()))?;
        self.filer.prepare_and_check()?;

        if create_new {
            self.filer.delete_all().wait_done(Wait::Infinite)?;
            self.next_id.store(1, Ordering::Release);
            self.root.store(0, Ordering::Release);
            self.write_check(Wait::Infinite)?;
            info!("Created new storage");
            return Ok(StorageCheck::Created);
        }

        let (scanned_max, object_count) = self.scan_objects()?;
        match self
            .filer
            .read_wait(CHECK_FILE_NAME, 0, CHECK_FILE_SIZE, Wait::Infinite)
        {
            Ok(bytes) => match CheckFile::from_bytes(&bytes) {
                Ok(check) => {
                    let next = check.next_id.max(scanned_max + 1);
                    self.next_id.store(next, Ordering::Release);
                    self.root.store(check.root.as_u64(), Ordering::Release);
                    info!(next_id = next, root = %check.root, "Resumed storage");
                    Ok(StorageCheck::Resumed)
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        objects = object_count,
                        "Storage check file unreadable, rebuilding allocator"
                    );
                    self.next_id.store(scanned_max + 1, Ordering::Release);
                    self.root.store(0, Ordering::Release);
                    Ok(StorageCheck::CheckFileMissing {
                        recovered_next_id: scanned_max + 1,
                        object_count,
                    })
                }
            },
            Err(CrystalError::NoData) if scanned_max == 0 => {
                self.next_id.store(1, Ordering::Release);
                self.root.store(0, Ordering::Release);
                self.write_check(Wait::Infinite)?;
                info!("Initialized empty storage");
                Ok(StorageCheck::Created)
            }
            Err(CrystalError::NoData) => {
                warn!(
                    max_id = scanned_max,
                    objects = object_count,
                    "Storage check file missing, rebuilding allocator"
                );
                self.next_id.store(scanned_max + 1, Ordering::Release);
                self.root.store(0, Ordering::Release);
                Ok(StorageCheck::CheckFileMissing {
                    recovered_next_id: scanned_max + 1,
                    object_count,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn put(&self, file_id: &mut FileId, data: &SharedBuffer, wait: Wait) -> CrystalResult<()> {
        self.ensure_ready()?;
        let limit = self.max_object_size();
        if data.len() > limit {
            return Err(CrystalError::OverSizeLimit {
                size: data.len(),
                limit,
            });
        }
        let header = Self::frame_header(data)?;

        let allocated = !file_id.is_assigned();
        let id = if allocated {
            FileId(self.next_id.fetch_add(1, Ordering::AcqRel))
        } else {
            *file_id
        };

        let path = Self::object_path(id);
        let header = self.pool.copy_from(&header);
        let body = self.filer.write(path.clone(), OBJECT_HEADER_SIZE, data.share());
        let head = self.filer.write(path, 0, header);

        if wait.blocks() {
            // One worker runs jobs in order, so the header finishing implies the body did.
            let result = head
                .wait_done(wait)
                .and_then(|_| body.wait_done(Wait::NoWait));
            match result {
                Ok(()) => {}
                // The write is still queued and will land under `id`.
                Err(CrystalError::Timeout) => {
                    *file_id = id;
                    return Err(CrystalError::Timeout);
                }
                Err(e) => {
                    if allocated {
                        warn!(id = %id, error = %e, "Object write failed, handle not assigned");
                    }
                    return Err(e);
                }
            }
        }
        *file_id = id;
        Ok(())
    }

    fn get(&self, file_id: FileId, wait: Wait) -> CrystalResult<SharedBuffer> {
        self.ensure_ready()?;
        if !file_id.is_assigned() {
            return Err(CrystalError::NoData);
        }
        let raw = self
            .filer
            .read_wait(Self::object_path(file_id), 0, TO_END, wait)?;
        self.unframe(file_id, &raw)
    }

    fn delete(&self, file_id: &mut FileId, wait: Wait) -> CrystalResult<()> {
        self.ensure_ready()?;
        if !file_id.is_assigned() {
            return Err(CrystalError::NoData);
        }
        let ticket = self.filer.delete(Self::object_path(*file_id));
        if wait.blocks() {
            ticket.wait_done(wait)?;
        }
        *file_id = FileId::UNASSIGNED;
        Ok(())
    }

    fn root(&self) -> FileId {
        FileId(self.root.load(Ordering::Acquire))
    }

    fn set_root(&self, root: FileId, wait: Wait) -> CrystalResult<()> {
        self.ensure_ready()?;
        self.root.store(root.as_u64(), Ordering::Release);
        self.write_check(wait)
    }

    fn flush(&self, wait: Wait) -> CrystalResult<()> {
        self.ensure_ready()?;
        self.write_check(wait)?;
        self.filer.drain(wait)
    }

    fn close(&self) -> CrystalResult<()> {
        if !self.filer.is_ready() {
            return Ok(());
        }
        let result = self.write_check(Wait::Infinite);
        self.filer.shutdown();
        info!("Storage closed");
        result
    }

    fn abort(&self) {
        self.filer.abort();
    }

    fn is_persistent(&self) -> bool {
        true
    }

    fn max_object_size(&self) -> usize {
        self.config.max_object_size.min(MAX_FRAMED_OBJECT_SIZE)
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }
}
