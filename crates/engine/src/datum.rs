//! Data units
//!
//! A [`DataUnit`] is one typed slot of a node. Its content lives in a
//! [`MemoryObject`] that is either absent (not loaded), empty, a decoded value
//! or raw bytes. Every decoded value keeps its encoding so saving, journaling
//! and size accounting never re-encode.
//!
//! # Locking
//!
//! The unit mutex is taken after its node's lock. Storage I/O of the unit and
//! its journal record happen under the unit mutex, so the journal order of a
//! unit's writes is the order they were applied in memory. A write that the
//! journal or storage rejects leaves the previous content in place.

use crate::context::TreeContext;
use crate::node::DataNode;
use crate::record::{self, TreeRecord};
use crate::registry::DatumValue;
use crystal_core::limits::MAX_RECORD_PAYLOAD;
use crystal_core::{CrystalError, CrystalResult, DatumTag, FileId, SharedBuffer};
use parking_lot::{Mutex, MutexGuard};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Encode a value with MessagePack (named fields)
pub(crate) fn encode_value<T: Serialize>(value: &T) -> CrystalResult<SharedBuffer> {
    rmp_serde::to_vec_named(value)
        .map(SharedBuffer::from_vec)
        .map_err(|e| CrystalError::invalid_argument(format!("value encode failed: {}", e)))
}

/// Decode a value written by [`encode_value`]
pub(crate) fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> CrystalResult<T> {
    rmp_serde::from_slice(bytes).map_err(|e| CrystalError::deserialize(e.to_string()))
}

/// Content of a resident unit
#[derive(Clone)]
pub(crate) enum Content {
    /// Nothing stored
    Empty,
    /// Decoded value and its encoding
    Object {
        value: Arc<dyn Any + Send + Sync>,
        type_name: &'static str,
        encoded: SharedBuffer,
    },
    /// Raw bytes, decoded on first typed access
    Buffer(SharedBuffer),
}

/// In-memory state of a unit
pub struct MemoryObject {
    content: Content,
    valid: bool,
    dirty: bool,
}

impl MemoryObject {
    fn new() -> Self {
        MemoryObject {
            content: Content::Empty,
            valid: false,
            dirty: false,
        }
    }

    /// Whether the content is resident
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Whether the content differs from storage
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Bytes charged to the cache
    pub fn resident_size(&self) -> u64 {
        match &self.content {
            Content::Empty => 0,
            Content::Object { encoded, .. } => encoded.len() as u64,
            Content::Buffer(bytes) => bytes.len() as u64,
        }
    }

    /// Encoded content, if any
    pub fn encoded(&self) -> Option<&SharedBuffer> {
        match &self.content {
            Content::Empty => None,
            Content::Object { encoded, .. } => Some(encoded),
            Content::Buffer(bytes) => Some(bytes),
        }
    }

    /// Whether the resident content equals `value`
    fn holds<T: DatumValue>(&self, value: &T, encoded: &[u8]) -> bool {
        match &self.content {
            Content::Object { value: current, .. } => {
                current.downcast_ref::<T>().map_or(false, |current| current == value)
            }
            Content::Buffer(bytes) => bytes[..] == encoded[..],
            Content::Empty => false,
        }
    }

    fn clear(&mut self) {
        self.content = Content::Empty;
        self.valid = false;
        self.dirty = false;
    }
}

struct UnitState {
    file_id: FileId,
    object: MemoryObject,
    /// Bytes currently counted in the cache total
    charged: u64,
    deleted: bool,
}

/// One typed slot of a node
pub struct DataUnit {
    tag: DatumTag,
    owner: Weak<DataNode>,
    state: Mutex<UnitState>,
    last_access: AtomicU64,
    resident: AtomicU64,
    tracked: AtomicBool,
}

impl DataUnit {
    pub(crate) fn new(tag: DatumTag, owner: Weak<DataNode>, file_id: FileId) -> Arc<Self> {
        Arc::new(DataUnit {
            tag,
            owner,
            state: Mutex::new(UnitState {
                file_id,
                object: MemoryObject::new(),
                charged: 0,
                deleted: false,
            }),
            last_access: AtomicU64::new(0),
            resident: AtomicU64::new(0),
            tracked: AtomicBool::new(false),
        })
    }

    /// Slot tag
    pub fn tag(&self) -> DatumTag {
        self.tag
    }

    /// Storage handle, unassigned until first save
    pub fn file_id(&self) -> FileId {
        self.state.lock().file_id
    }

    /// Whether content is in memory
    pub fn is_resident(&self) -> bool {
        self.state.lock().object.is_valid()
    }

    /// Whether content has unsaved changes
    pub fn is_dirty(&self) -> bool {
        self.state.lock().object.is_dirty()
    }

    /// Resident bytes, readable without the unit lock
    pub fn resident_size(&self) -> u64 {
        self.resident.load(Ordering::Acquire)
    }

    pub(crate) fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Acquire)
    }

    /// Marks the unit as registered with the cache; true the first time
    pub(crate) fn mark_tracked(&self) -> bool {
        !self.tracked.swap(true, Ordering::AcqRel)
    }

    fn touch(&self, ctx: &TreeContext) {
        self.last_access.store(ctx.himo.epoch(), Ordering::Release);
    }

    /// Bring the cache total in line with the resident content
    fn settle(self: &Arc<Self>, st: &mut UnitState, ctx: &TreeContext) {
        let size = st.object.resident_size();
        ctx.himo.adjust(st.charged, size);
        st.charged = size;
        self.resident.store(size, Ordering::Release);
        if size > 0 {
            ctx.himo.track(self);
        }
    }

    fn lock_live(&self) -> CrystalResult<MutexGuard<'_, UnitState>> {
        let st = self.state.lock();
        if st.deleted {
            return Err(CrystalError::Removed);
        }
        Ok(st)
    }

    fn ensure_loaded(self: &Arc<Self>, st: &mut UnitState, ctx: &TreeContext) -> CrystalResult<()> {
        if st.object.valid {
            return Ok(());
        }
        if !st.file_id.is_assigned() {
            st.object.content = Content::Empty;
            st.object.valid = true;
            return Ok(());
        }
        let bytes = ctx.storage.get(st.file_id, ctx.wait)?;
        debug!(tag = %self.tag, file_id = %st.file_id, len = bytes.len(), "Loaded datum");
        st.object.content = Content::Buffer(bytes);
        st.object.valid = true;
        self.settle(st, ctx);
        Ok(())
    }

    /// Load content from storage if it is not resident
    pub(crate) fn load(self: &Arc<Self>, ctx: &TreeContext) -> CrystalResult<()> {
        let mut st = self.lock_live()?;
        self.ensure_loaded(&mut st, ctx)?;
        self.touch(ctx);
        Ok(())
    }

    /// Typed content; decodes raw bytes or constructs the initial value
    pub(crate) fn get<T: DatumValue>(
        self: &Arc<Self>,
        ctx: &TreeContext,
        node: &DataNode,
    ) -> CrystalResult<Arc<T>> {
        let mut st = self.lock_live()?;
        self.ensure_loaded(&mut st, ctx)?;
        self.touch(ctx);

        let (value, encoded): (Arc<T>, SharedBuffer) = match &st.object.content {
            Content::Object {
                value, type_name, ..
            } => {
                return Arc::clone(value)
                    .downcast::<T>()
                    .map_err(|_| CrystalError::InvalidCast {
                        expected: std::any::type_name::<T>().to_string(),
                        found: type_name.to_string(),
                    });
            }
            Content::Buffer(bytes) => (Arc::new(decode_value::<T>(bytes)?), bytes.share()),
            Content::Empty => {
                let constructed = ctx
                    .registry
                    .descriptor(self.tag)
                    .and_then(|d| d.construct(node))
                    .ok_or(CrystalError::NoData)??;
                let found = ctx
                    .registry
                    .descriptor(self.tag)
                    .map_or("unknown", |d| d.type_name());
                let value = constructed.value.downcast::<T>().map_err(|_| {
                    CrystalError::InvalidCast {
                        expected: std::any::type_name::<T>().to_string(),
                        found: found.to_string(),
                    }
                })?;
                (value, constructed.encoded)
            }
        };

        st.object.content = Content::Object {
            value: Arc::clone(&value) as Arc<dyn Any + Send + Sync>,
            type_name: std::any::type_name::<T>(),
            encoded,
        };
        self.settle(&mut st, ctx);
        Ok(value)
    }

    /// Encoded content
    pub(crate) fn get_buffer(self: &Arc<Self>, ctx: &TreeContext) -> CrystalResult<SharedBuffer> {
        let mut st = self.lock_live()?;
        self.ensure_loaded(&mut st, ctx)?;
        self.touch(ctx);
        st.object
            .encoded()
            .map(SharedBuffer::share)
            .ok_or(CrystalError::NoData)
    }

    /// Replace the content with a typed value; false when it was equal
    pub(crate) fn set<T: DatumValue>(
        self: &Arc<Self>,
        ctx: &TreeContext,
        value: Arc<T>,
        encoded: SharedBuffer,
    ) -> CrystalResult<bool> {
        let unchanged = |object: &MemoryObject| object.holds(&*value, &encoded);
        let incoming = Content::Object {
            value: Arc::clone(&value) as Arc<dyn Any + Send + Sync>,
            type_name: std::any::type_name::<T>(),
            encoded: encoded.share(),
        };
        self.write(ctx, incoming, unchanged)
    }

    /// Replace the content with raw bytes; false when they were equal
    pub(crate) fn set_buffer(
        self: &Arc<Self>,
        ctx: &TreeContext,
        bytes: SharedBuffer,
    ) -> CrystalResult<bool> {
        let unchanged =
            |object: &MemoryObject| object.encoded().map_or(false, |current| *current == bytes);
        self.write(ctx, Content::Buffer(bytes.share()), unchanged)
    }

    fn write(
        self: &Arc<Self>,
        ctx: &TreeContext,
        incoming: Content,
        unchanged: impl FnOnce(&MemoryObject) -> bool,
    ) -> CrystalResult<bool> {
        let mut st = self.lock_live()?;
        self.touch(ctx);
        if st.object.valid && unchanged(&st.object) {
            return Ok(false);
        }
        let bytes = match &incoming {
            Content::Empty => SharedBuffer::empty(),
            Content::Object { encoded, .. } => encoded.share(),
            Content::Buffer(bytes) => bytes.share(),
        };
        let limit = ctx.storage.max_object_size();
        if bytes.len() > limit {
            return Err(CrystalError::OverSizeLimit {
                size: bytes.len(),
                limit,
            });
        }
        // The journal must accept the write before memory reflects it.
        let stored = if ctx.journaling() {
            self.journal_write(&mut st, ctx, bytes)?
        } else {
            false
        };
        st.object.content = incoming;
        st.object.valid = true;
        st.object.dirty = !(stored && ctx.storage.is_persistent());
        self.settle(&mut st, ctx);
        Ok(true)
    }

    /// Journal `bytes` as the unit's new content.
    ///
    /// Content too large for one record is stored under a fresh handle and
    /// journaled as a binding; returns true in that case.
    fn journal_write(
        &self,
        st: &mut UnitState,
        ctx: &TreeContext,
        bytes: SharedBuffer,
    ) -> CrystalResult<bool> {
        let node = match self.owner.upgrade() {
            Some(node) => node,
            None => return Ok(false),
        };
        let record = TreeRecord::DatumWrite {
            path: node.path_names(),
            tag: self.tag,
            bytes: bytes.share(),
        };
        let writer = record.to_writer(ctx.journal.as_ref())?;
        if writer.len() <= MAX_RECORD_PAYLOAD {
            ctx.journal.add_record(writer)?;
            return Ok(false);
        }
        drop(writer);

        debug!(tag = %self.tag, len = bytes.len(), "Datum exceeds record limit, storing directly");
        let path = match record {
            TreeRecord::DatumWrite { path, .. } => path,
            _ => node.path_names(),
        };
        let mut fresh = FileId::UNASSIGNED;
        let stored = ctx.storage.put(&mut fresh, &bytes, ctx.wait).and_then(|_| {
            record::append(
                ctx.journal.as_ref(),
                &TreeRecord::DatumBind {
                    path,
                    tag: self.tag,
                    file_id: fresh,
                },
            )
        });
        if let Err(e) = stored {
            ctx.retire(fresh);
            return Err(e);
        }
        self.relocate(st, ctx, fresh);
        Ok(true)
    }

    /// Switch to `fresh`; the old handle is deleted after the next save
    fn relocate(&self, st: &mut UnitState, ctx: &TreeContext, fresh: FileId) {
        let old = std::mem::replace(&mut st.file_id, fresh);
        if old == fresh {
            return;
        }
        if let Some(node) = self.owner.upgrade() {
            node.mark_manifest_dirty();
        }
        ctx.retire(old);
    }

    /// Store the resident content under a fresh handle.
    ///
    /// The previous object stays intact until a root that no longer names it
    /// has been written.
    fn put_locked(&self, st: &mut UnitState, ctx: &TreeContext) -> CrystalResult<()> {
        let bytes = st
            .object
            .encoded()
            .map(SharedBuffer::share)
            .unwrap_or_else(SharedBuffer::empty);
        let mut fresh = FileId::UNASSIGNED;
        if let Err(e) = ctx.storage.put(&mut fresh, &bytes, ctx.wait) {
            ctx.retire(fresh);
            return Err(e);
        }
        self.relocate(st, ctx, fresh);
        // Non-persistent storage keeps nothing, so the content stays dirty
        if ctx.storage.is_persistent() {
            st.object.dirty = false;
        }
        Ok(())
    }

    /// Write dirty content to storage
    pub(crate) fn save(&self, ctx: &TreeContext) -> CrystalResult<()> {
        let mut st = self.state.lock();
        if st.deleted || !st.object.dirty {
            return Ok(());
        }
        self.put_locked(&mut st, ctx)
    }

    /// Drop resident content, saving it first when dirty.
    ///
    /// Returns the bytes released, or `None` when the unit stays resident.
    pub(crate) fn unload(self: &Arc<Self>, ctx: &TreeContext) -> CrystalResult<Option<u64>> {
        let mut st = self.state.lock();
        self.unload_locked(&mut st, ctx)
    }

    /// Like [`unload`](Self::unload) but gives up when the unit is busy
    pub(crate) fn try_unload(self: &Arc<Self>, ctx: &TreeContext) -> CrystalResult<Option<u64>> {
        match self.state.try_lock() {
            Some(mut st) => self.unload_locked(&mut st, ctx),
            None => Ok(None),
        }
    }

    fn unload_locked(
        self: &Arc<Self>,
        st: &mut UnitState,
        ctx: &TreeContext,
    ) -> CrystalResult<Option<u64>> {
        if st.deleted || !st.object.valid {
            return Ok(None);
        }
        if st.object.dirty {
            if !ctx.storage.is_persistent() {
                return Ok(None);
            }
            self.put_locked(st, ctx)?;
        }
        let freed = st.charged;
        st.object.clear();
        self.settle(st, ctx);
        Ok(Some(freed))
    }

    /// Point the unit at content already in storage
    pub(crate) fn bind(self: &Arc<Self>, ctx: &TreeContext, file_id: FileId) -> CrystalResult<()> {
        let mut st = self.lock_live()?;
        self.relocate(&mut st, ctx, file_id);
        st.object.clear();
        self.settle(&mut st, ctx);
        Ok(())
    }

    /// Delete the unit; `before` runs under the unit lock first
    pub(crate) fn retire(
        self: &Arc<Self>,
        ctx: &TreeContext,
        before: impl FnOnce() -> CrystalResult<()>,
    ) -> CrystalResult<()> {
        let mut st = self.state.lock();
        if st.deleted {
            return Ok(());
        }
        before()?;
        st.deleted = true;
        ctx.retire(st.file_id);
        st.file_id = FileId::UNASSIGNED;
        st.object.clear();
        self.settle(&mut st, ctx);
        Ok(())
    }
}

impl std::fmt::Debug for DataUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataUnit")
            .field("tag", &self.tag)
            .field("resident", &self.resident_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    impl DatumValue for Point {
        const TYPE_TAG: DatumTag = DatumTag(4);
    }

    #[test]
    fn test_value_codec() {
        let bytes = encode_value(&Point { x: 3, y: -4 }).unwrap();
        let back: Point = decode_value(&bytes).unwrap();
        assert_eq!(back, Point { x: 3, y: -4 });
    }

    #[test]
    fn test_decode_garbage_is_deserialize_error() {
        let err = decode_value::<Point>(&[0xc1, 0x00]).unwrap_err();
        assert!(matches!(err, CrystalError::DeserializeError(_)));
    }

    #[test]
    fn test_memory_object_equality() {
        let value = Point { x: 1, y: 2 };
        let encoded = encode_value(&value).unwrap();
        let mut object = MemoryObject::new();
        assert!(!object.holds(&value, &encoded));

        object.content = Content::Buffer(encoded.share());
        assert!(object.holds(&value, &encoded));

        object.content = Content::Object {
            value: Arc::new(Point { x: 1, y: 2 }),
            type_name: "Point",
            encoded: encoded.share(),
        };
        assert!(object.holds(&value, &encoded));
        assert!(!object.holds(&Point { x: 9, y: 2 }, &encoded));
        assert_eq!(object.resident_size(), encoded.len() as u64);

        object.clear();
        assert_eq!(object.resident_size(), 0);
        assert!(!object.is_valid());
    }
}
