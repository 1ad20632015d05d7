//! Data tree nodes
//!
//! A [`DataNode`] owns its children and its data units. Children are kept in
//! insertion order with an identifier index; the parent link is weak and never
//! changes. Deleting a node is terminal: the node and its whole subtree report
//! `Removed` from then on, and a later `get_or_create_child` with the same
//! name builds a fresh node.
//!
//! # Persistence
//!
//! Each node is saved as a manifest object listing its unit handles and its
//! children's manifest handles. The root manifest handle is the storage root
//! pointer. Mutations mark manifests dirty; saves rewrite only dirty ones.
//!
//! # Locking
//!
//! One `RwLock` per node. A parent's lock is always taken before a child's,
//! and a node's lock before its units' mutexes.

use crate::context::TreeContext;
use crate::datum::{encode_value, DataUnit};
use crate::record::TreeRecord;
use crate::registry::DatumValue;
use crystal_core::{CrystalError, CrystalResult, DatumTag, FileId, Identifier, SharedBuffer};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Children in insertion order, indexed by identifier
#[derive(Default)]
pub(crate) struct ChildSet {
    order: Vec<Arc<DataNode>>,
    index: FxHashMap<Identifier, usize>,
}

impl ChildSet {
    fn get(&self, id: Identifier) -> Option<&Arc<DataNode>> {
        self.index.get(&id).map(|&pos| &self.order[pos])
    }

    fn insert(&mut self, node: Arc<DataNode>) {
        self.index.insert(node.id, self.order.len());
        self.order.push(node);
    }

    fn remove(&mut self, id: Identifier) -> Option<Arc<DataNode>> {
        let pos = self.index.remove(&id)?;
        let node = self.order.remove(pos);
        for (i, later) in self.order.iter().enumerate().skip(pos) {
            self.index.insert(later.id, i);
        }
        Some(node)
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn snapshot(&self) -> Vec<Arc<DataNode>> {
        self.order.clone()
    }

    fn take_all(&mut self) -> Vec<Arc<DataNode>> {
        self.index.clear();
        std::mem::take(&mut self.order)
    }
}

/// Persisted form of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct NodeManifest {
    pub(crate) name: String,
    /// (tag, unit handle)
    pub(crate) slots: Vec<(u8, u64)>,
    /// (child name, manifest handle)
    pub(crate) children: Vec<(String, u64)>,
}

impl NodeManifest {
    fn encode(&self) -> CrystalResult<SharedBuffer> {
        rmp_serde::to_vec(self)
            .map(SharedBuffer::from_vec)
            .map_err(|e| CrystalError::invalid_argument(format!("manifest encode failed: {}", e)))
    }

    fn decode(bytes: &[u8]) -> CrystalResult<Self> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| CrystalError::deserialize(format!("node manifest: {}", e)))
    }
}

struct NodeInner {
    children: ChildSet,
    slots: SmallVec<[Arc<DataUnit>; 4]>,
    manifest_id: FileId,
    removed: bool,
}

/// A node of the data tree
pub struct DataNode {
    id: Identifier,
    name: String,
    is_root: bool,
    parent: Weak<DataNode>,
    this: Weak<DataNode>,
    ctx: Arc<TreeContext>,
    inner: RwLock<NodeInner>,
    manifest_dirty: AtomicBool,
    save_lock: Mutex<()>,
}

fn validate_name(name: &str) -> CrystalResult<()> {
    if name.is_empty() {
        return Err(CrystalError::invalid_argument("node name must not be empty"));
    }
    if name.contains('/') {
        return Err(CrystalError::invalid_argument(format!(
            "node name '{}' must not contain '/'",
            name
        )));
    }
    Ok(())
}

impl DataNode {
    fn build(
        ctx: &Arc<TreeContext>,
        name: &str,
        is_root: bool,
        parent: Weak<DataNode>,
        manifest_id: FileId,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| DataNode {
            id: Identifier::from_name(name),
            name: name.to_string(),
            is_root,
            parent,
            this: this.clone(),
            ctx: Arc::clone(ctx),
            inner: RwLock::new(NodeInner {
                children: ChildSet::default(),
                slots: SmallVec::new(),
                manifest_id,
                removed: false,
            }),
            manifest_dirty: AtomicBool::new(!manifest_id.is_assigned()),
            save_lock: Mutex::new(()),
        })
    }

    /// Identifier derived from the name
    pub fn id(&self) -> Identifier {
        self.id
    }

    /// Node name; empty for the root
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is the root
    pub fn is_root(&self) -> bool {
        self.is_root
    }

    /// Parent node, `None` for the root
    pub fn parent(&self) -> Option<Arc<DataNode>> {
        self.parent.upgrade()
    }

    /// Whether the node was deleted
    pub fn is_removed(&self) -> bool {
        self.inner.read().removed
    }

    /// Names from the root down to this node
    pub fn path_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if self.is_root {
            return names;
        }
        names.push(self.name.clone());
        let mut next = self.parent.upgrade();
        while let Some(node) = next {
            if node.is_root {
                break;
            }
            names.push(node.name.clone());
            next = node.parent.upgrade();
        }
        names.reverse();
        names
    }

    /// Slash-separated path, `/` for the root
    pub fn path(&self) -> String {
        format!("/{}", self.path_names().join("/"))
    }

    /// Handle of the saved manifest
    pub fn manifest_id(&self) -> FileId {
        self.inner.read().manifest_id
    }

    pub(crate) fn mark_manifest_dirty(&self) {
        self.manifest_dirty.store(true, Ordering::Release);
    }

    fn read_live(&self) -> CrystalResult<RwLockReadGuard<'_, NodeInner>> {
        let inner = self.inner.read();
        if inner.removed {
            return Err(CrystalError::Removed);
        }
        Ok(inner)
    }

    fn arc(&self) -> CrystalResult<Arc<DataNode>> {
        self.this.upgrade().ok_or(CrystalError::Removed)
    }

    // ========================================================================
    // Children
    // ========================================================================

    /// Child called `name`, created if absent.
    ///
    /// Concurrent calls with the same name return the same node.
    pub fn get_or_create_child(&self, name: &str) -> CrystalResult<Arc<DataNode>> {
        validate_name(name)?;
        let id = Identifier::from_name(name);
        {
            let inner = self.read_live()?;
            if let Some(child) = inner.children.get(id) {
                return same_name(child, name);
            }
        }

        let child = {
            let mut inner = self.inner.write();
            if inner.removed {
                return Err(CrystalError::Removed);
            }
            if let Some(child) = inner.children.get(id) {
                return same_name(child, name);
            }
            let child = DataNode::build(
                &self.ctx,
                name,
                false,
                self.this.clone(),
                FileId::UNASSIGNED,
            );
            self.ctx.journal(&TreeRecord::NodeCreate {
                path: child.path_names(),
            })?;
            inner.children.insert(Arc::clone(&child));
            self.mark_manifest_dirty();
            child
        };
        debug!(path = %child.path(), "Created node");

        if self.ctx.saves_instantly() {
            child.persist_chain()?;
        }
        Ok(child)
    }

    /// Child called `name`, if present
    pub fn try_get_child(&self, name: &str) -> CrystalResult<Option<Arc<DataNode>>> {
        let inner = self.read_live()?;
        Ok(inner
            .children
            .get(Identifier::from_name(name))
            .filter(|child| child.name == name)
            .cloned())
    }

    /// Child with identifier `id`, if present
    pub fn child_by_id(&self, id: Identifier) -> CrystalResult<Option<Arc<DataNode>>> {
        Ok(self.read_live()?.children.get(id).cloned())
    }

    /// Descendant reached by following `names`; an empty sequence is this node
    pub fn descendant<I, S>(&self, names: I) -> CrystalResult<Option<Arc<DataNode>>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut node = self.arc()?;
        for name in names {
            match node.try_get_child(name.as_ref())? {
                Some(child) => node = child,
                None => return Ok(None),
            }
        }
        Ok(Some(node))
    }

    /// Snapshot of the children in insertion order
    pub fn children(&self) -> CrystalResult<Vec<Arc<DataNode>>> {
        Ok(self.read_live()?.children.snapshot())
    }

    /// Number of children
    pub fn child_count(&self) -> CrystalResult<usize> {
        Ok(self.read_live()?.children.len())
    }

    /// Delete the child called `name` with its subtree.
    ///
    /// Returns false when there was no such child.
    pub fn delete_child(&self, name: &str) -> CrystalResult<bool> {
        self.remove_child(Identifier::from_name(name), |child| child.name == name)
    }

    /// Delete this node from its parent.
    ///
    /// Returns false for the root and for nodes already deleted.
    pub fn remove(&self) -> CrystalResult<bool> {
        if self.is_root || self.is_removed() {
            return Ok(false);
        }
        let parent = match self.parent.upgrade() {
            Some(parent) => parent,
            None => return Ok(false),
        };
        match parent.remove_child(self.id, |child| std::ptr::eq(&**child, self)) {
            Err(CrystalError::Removed) => Ok(false),
            other => other,
        }
    }

    fn remove_child(
        &self,
        id: Identifier,
        matches: impl FnOnce(&Arc<DataNode>) -> bool,
    ) -> CrystalResult<bool> {
        let child = {
            let mut inner = self.inner.write();
            if inner.removed {
                return Err(CrystalError::Removed);
            }
            let child = match inner.children.get(id) {
                Some(child) if matches(child) => Arc::clone(child),
                _ => return Ok(false),
            };
            self.ctx.journal(&TreeRecord::NodeDelete {
                path: child.path_names(),
            })?;
            inner.children.remove(id);
            child.inner.write().removed = true;
            self.mark_manifest_dirty();
            child
        };
        debug!(path = %child.path(), "Deleted node");
        child.destroy();

        if self.ctx.saves_instantly() {
            self.persist_chain()?;
        }
        Ok(true)
    }

    /// Release the storage of a removed subtree
    fn destroy(&self) {
        let mut pending = self.detach();
        while let Some(node) = pending.pop() {
            pending.extend(node.detach());
        }
    }

    fn detach(&self) -> Vec<Arc<DataNode>> {
        let (children, slots) = {
            let mut inner = self.inner.write();
            inner.removed = true;
            let manifest_id = std::mem::replace(&mut inner.manifest_id, FileId::UNASSIGNED);
            self.ctx.retire(manifest_id);
            (inner.children.take_all(), std::mem::take(&mut inner.slots))
        };
        for unit in slots {
            // Without a `before` hook retiring cannot fail
            let _ = unit.retire(&self.ctx, || Ok(()));
        }
        children
    }

    // ========================================================================
    // Data units
    // ========================================================================

    fn find_unit(&self, tag: DatumTag) -> CrystalResult<Option<Arc<DataUnit>>> {
        let inner = self.read_live()?;
        Ok(inner.slots.iter().find(|unit| unit.tag() == tag).cloned())
    }

    fn unit_or_insert(&self, tag: DatumTag) -> CrystalResult<Arc<DataUnit>> {
        if let Some(unit) = self.find_unit(tag)? {
            return Ok(unit);
        }
        let mut inner = self.inner.write();
        if inner.removed {
            return Err(CrystalError::Removed);
        }
        if let Some(unit) = inner.slots.iter().find(|unit| unit.tag() == tag) {
            return Ok(Arc::clone(unit));
        }
        let unit = DataUnit::new(tag, self.this.clone(), FileId::UNASSIGNED);
        inner.slots.push(Arc::clone(&unit));
        Ok(unit)
    }

    /// The `tag` unit, if present
    pub fn datum(&self, tag: DatumTag) -> CrystalResult<Option<Arc<DataUnit>>> {
        self.find_unit(tag)
    }

    fn existing_unit(&self, tag: DatumTag) -> CrystalResult<Arc<DataUnit>> {
        self.find_unit(tag)?.ok_or(CrystalError::NoData)
    }

    /// Typed content of the `T::TYPE_TAG` unit.
    ///
    /// An empty unit gets the registered constructor's value; without a
    /// constructor it reports `NoData`.
    pub fn get<T: DatumValue>(&self) -> CrystalResult<Arc<T>> {
        self.ctx.registry.check::<T>()?;
        let unit = match self.find_unit(T::TYPE_TAG)? {
            Some(unit) => unit,
            None => {
                let constructible = self
                    .ctx
                    .registry
                    .descriptor(T::TYPE_TAG)
                    .map_or(false, |d| d.has_constructor());
                if !constructible {
                    return Err(CrystalError::NoData);
                }
                self.unit_or_insert(T::TYPE_TAG)?
            }
        };
        unit.get::<T>(&self.ctx, self)
    }

    /// Replace the `T::TYPE_TAG` unit's content.
    ///
    /// Writing a value equal to the resident one changes nothing.
    pub fn set<T: DatumValue>(&self, value: T) -> CrystalResult<()> {
        self.ctx.registry.check::<T>()?;
        let encoded = encode_value(&value)?;
        let value = Arc::new(value);
        self.write_unit(T::TYPE_TAG, |unit| {
            unit.set(&self.ctx, Arc::clone(&value), encoded.share())
        })
    }

    /// Encoded content of the `tag` unit
    pub fn get_buffer(&self, tag: DatumTag) -> CrystalResult<SharedBuffer> {
        self.existing_unit(tag)?.get_buffer(&self.ctx)
    }

    /// Replace the `tag` unit's content with raw bytes
    pub fn set_buffer(&self, tag: DatumTag, bytes: SharedBuffer) -> CrystalResult<()> {
        self.write_unit(tag, |unit| unit.set_buffer(&self.ctx, bytes.share()))
    }

    fn write_unit(
        &self,
        tag: DatumTag,
        write: impl Fn(&Arc<DataUnit>) -> CrystalResult<bool>,
    ) -> CrystalResult<()> {
        loop {
            let unit = self.unit_or_insert(tag)?;
            match write(&unit) {
                Ok(true) => {
                    if self.ctx.saves_instantly() {
                        unit.save(&self.ctx)?;
                        self.persist_chain()?;
                    }
                    return Ok(());
                }
                Ok(false) => return Ok(()),
                // The slot was deleted between lookup and write
                Err(CrystalError::Removed) if !self.is_removed() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Make the `tag` unit resident
    pub fn load_datum(&self, tag: DatumTag) -> CrystalResult<()> {
        self.existing_unit(tag)?.load(&self.ctx)
    }

    /// Write the `tag` unit to storage if it is dirty
    pub fn save_datum(&self, tag: DatumTag) -> CrystalResult<()> {
        self.existing_unit(tag)?.save(&self.ctx)
    }

    /// Drop the `tag` unit's resident content, saving it first when dirty.
    ///
    /// Returns false when nothing was unloaded.
    pub fn unload_datum(&self, tag: DatumTag) -> CrystalResult<bool> {
        match self.find_unit(tag)? {
            Some(unit) => Ok(unit.unload(&self.ctx)?.is_some()),
            None => Ok(false),
        }
    }

    /// Delete the `tag` unit. Returns false when there was none.
    pub fn delete_datum(&self, tag: DatumTag) -> CrystalResult<bool> {
        {
            let mut inner = self.inner.write();
            if inner.removed {
                return Err(CrystalError::Removed);
            }
            let pos = match inner.slots.iter().position(|unit| unit.tag() == tag) {
                Some(pos) => pos,
                None => return Ok(false),
            };
            let unit = Arc::clone(&inner.slots[pos]);
            let path = self.path_names();
            unit.retire(&self.ctx, || {
                self.ctx.journal(&TreeRecord::DatumDelete { path, tag })
            })?;
            inner.slots.remove(pos);
            self.mark_manifest_dirty();
        }
        if self.ctx.saves_instantly() {
            self.persist_chain()?;
        }
        Ok(true)
    }

    /// Whether a `tag` unit exists
    pub fn has_datum(&self, tag: DatumTag) -> CrystalResult<bool> {
        Ok(self.find_unit(tag)?.is_some())
    }

    /// Tags of every unit, in slot order
    pub fn datum_tags(&self) -> CrystalResult<Vec<DatumTag>> {
        Ok(self.read_live()?.slots.iter().map(|u| u.tag()).collect())
    }

    /// Point the `tag` unit at content already in storage
    pub(crate) fn bind_datum(&self, tag: DatumTag, file_id: FileId) -> CrystalResult<()> {
        self.unit_or_insert(tag)?.bind(&self.ctx, file_id)
    }

    // ========================================================================
    // Saving and loading
    // ========================================================================

    /// Save dirty units and the manifest; `recursive` includes the subtree,
    /// `unload` drops unit content after saving it.
    ///
    /// A unit or child that fails does not stop the others; the first error
    /// is returned after the manifest was written.
    pub fn save(&self, recursive: bool, unload: bool) -> CrystalResult<()> {
        let (slots, children) = {
            let inner = self.read_live()?;
            let children = if recursive {
                inner.children.snapshot()
            } else {
                Vec::new()
            };
            (inner.slots.clone(), children)
        };
        let mut failure: Option<CrystalError> = None;
        for unit in &slots {
            let saved = unit.save(&self.ctx).and_then(|_| {
                if unload {
                    unit.unload(&self.ctx).map(|_| ())
                } else {
                    Ok(())
                }
            });
            if let Err(e) = saved {
                warn!(path = %self.path(), tag = %unit.tag(), error = %e, "Datum save failed");
                failure.get_or_insert(e);
            }
        }
        for child in children {
            match child.save(true, unload) {
                // Deleted concurrently; the parent manifest drops it
                Ok(()) | Err(CrystalError::Removed) => {}
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        let saved = self.save_manifest();
        match failure {
            Some(e) => Err(e),
            None => saved,
        }
    }

    /// Rewrite the manifest if it changed; children without a manifest get
    /// one first
    fn save_manifest(&self) -> CrystalResult<()> {
        let _guard = self.save_lock.lock();
        let pending: Vec<Arc<DataNode>> = {
            let inner = self.inner.read();
            // Mutations mark the manifest under the write lock, so the flag
            // read here matches the state encoded below.
            let was_dirty = self.manifest_dirty.swap(false, Ordering::AcqRel);
            if inner.removed || (!was_dirty && inner.manifest_id.is_assigned()) {
                return Ok(());
            }
            inner
                .children
                .order
                .iter()
                .filter(|child| !child.manifest_id().is_assigned())
                .cloned()
                .collect()
        };
        let result = self.write_manifest(pending);
        if result.is_err() {
            self.mark_manifest_dirty();
        }
        result
    }

    /// Store the manifest under a fresh handle and retire the old one
    fn write_manifest(&self, pending: Vec<Arc<DataNode>>) -> CrystalResult<()> {
        for child in pending {
            child.save_manifest()?;
        }
        let bytes = {
            let inner = self.inner.read();
            if inner.removed {
                return Ok(());
            }
            self.manifest(&inner).encode()?
        };
        let mut fresh = FileId::UNASSIGNED;
        if let Err(e) = self.ctx.storage.put(&mut fresh, &bytes, self.ctx.wait) {
            self.ctx.retire(fresh);
            return Err(e);
        }
        let old = {
            let mut inner = self.inner.write();
            if inner.removed {
                self.ctx.retire(fresh);
                return Ok(());
            }
            std::mem::replace(&mut inner.manifest_id, fresh)
        };
        if let Some(parent) = self.parent.upgrade() {
            parent.mark_manifest_dirty();
        }
        self.ctx.retire(old);
        Ok(())
    }

    fn manifest(&self, inner: &NodeInner) -> NodeManifest {
        NodeManifest {
            name: self.name.clone(),
            slots: inner
                .slots
                .iter()
                .map(|unit| (unit.tag().as_u8(), unit.file_id()))
                .filter(|(_, id)| id.is_assigned())
                .map(|(tag, id)| (tag, id.as_u64()))
                .collect(),
            children: inner
                .children
                .order
                .iter()
                .map(|child| (child.name.clone(), child.manifest_id()))
                .filter(|(_, id)| id.is_assigned())
                .map(|(name, id)| (name, id.as_u64()))
                .collect(),
        }
    }

    /// Save manifests from this node up to the root and move the root pointer.
    ///
    /// Retired handles are left for the next full save; another node's dirty
    /// manifest may still name them in the root written here.
    fn persist_chain(&self) -> CrystalResult<()> {
        let _guard = self.ctx.save_lock.lock();
        let mut node = self.arc()?;
        loop {
            node.save_manifest()?;
            match node.parent.upgrade() {
                Some(parent) => node = parent,
                None => break,
            }
        }
        if node.is_root {
            let root_id = node.manifest_id();
            if self.ctx.storage.root() != root_id {
                self.ctx.storage.set_root(root_id, self.ctx.wait)?;
            }
        }
        Ok(())
    }

    /// Root of a fresh tree, or the tree saved under the storage root pointer.
    ///
    /// Unit content is not loaded; children whose manifest is gone are
    /// dropped with a warning.
    pub(crate) fn load_root(ctx: &Arc<TreeContext>) -> CrystalResult<Arc<DataNode>> {
        let root_id = ctx.storage.root();
        let root = DataNode::build(ctx, "", true, Weak::new(), root_id);
        if !root_id.is_assigned() {
            return Ok(root);
        }

        let manifest = NodeManifest::decode(&ctx.storage.get(root_id, ctx.wait)?)?;
        let mut pending = vec![(Arc::clone(&root), manifest)];
        let mut loaded = 1usize;
        while let Some((node, manifest)) = pending.pop() {
            let mut inner = node.inner.write();
            for (tag, file_id) in manifest.slots {
                inner
                    .slots
                    .push(DataUnit::new(DatumTag(tag), node.this.clone(), FileId(file_id)));
            }
            for (name, manifest_id) in manifest.children {
                let manifest_id = FileId(manifest_id);
                let child_manifest = match ctx.storage.get(manifest_id, ctx.wait) {
                    Ok(bytes) => NodeManifest::decode(&bytes)?,
                    Err(CrystalError::NoData) => {
                        warn!(parent = %node.path(), child = %name, "Child manifest missing, dropping child");
                        node.mark_manifest_dirty();
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                if child_manifest.name != name {
                    return Err(CrystalError::deserialize(format!(
                        "manifest {} names '{}', parent expects '{}'",
                        manifest_id, child_manifest.name, name
                    )));
                }
                let child = DataNode::build(ctx, &name, false, node.this.clone(), manifest_id);
                inner.children.insert(Arc::clone(&child));
                pending.push((child, child_manifest));
                loaded += 1;
            }
        }
        debug!(nodes = loaded, root = %root_id, "Loaded tree structure");
        Ok(root)
    }
}

fn same_name(child: &Arc<DataNode>, name: &str) -> CrystalResult<Arc<DataNode>> {
    if child.name == name {
        Ok(Arc::clone(child))
    } else {
        Err(CrystalError::invalid_argument(format!(
            "node names '{}' and '{}' share identifier {}",
            child.name, name, child.id
        )))
    }
}

impl std::fmt::Debug for DataNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataNode")
            .field("id", &self.id)
            .field("path", &self.path())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DatumRegistry;
    use crystal_core::Wait;
    use crystal_storage::{NullStorage, Storage, StorageCheck};

    /// Null storage that refuses payloads starting with 0xEE
    struct RefusingStorage(NullStorage);

    impl Storage for RefusingStorage {
        fn prepare_and_check(&self, create_new: bool) -> CrystalResult<StorageCheck> {
            self.0.prepare_and_check(create_new)
        }

        fn put(&self, file_id: &mut FileId, data: &SharedBuffer, wait: Wait) -> CrystalResult<()> {
            if data.first() == Some(&0xEE) {
                return Err(CrystalError::FileError("refused".into()));
            }
            self.0.put(file_id, data, wait)
        }

        fn get(&self, file_id: FileId, wait: Wait) -> CrystalResult<SharedBuffer> {
            self.0.get(file_id, wait)
        }

        fn delete(&self, file_id: &mut FileId, wait: Wait) -> CrystalResult<()> {
            self.0.delete(file_id, wait)
        }

        fn root(&self) -> FileId {
            self.0.root()
        }

        fn set_root(&self, root: FileId, wait: Wait) -> CrystalResult<()> {
            self.0.set_root(root, wait)
        }

        fn flush(&self, wait: Wait) -> CrystalResult<()> {
            self.0.flush(wait)
        }

        fn close(&self) -> CrystalResult<()> {
            self.0.close()
        }

        fn abort(&self) {
            self.0.abort()
        }

        fn is_persistent(&self) -> bool {
            self.0.is_persistent()
        }

        fn max_object_size(&self) -> usize {
            self.0.max_object_size()
        }

        fn backend_name(&self) -> &'static str {
            "refusing"
        }
    }

    fn root() -> Arc<DataNode> {
        let ctx = TreeContext::in_memory(DatumRegistry::new());
        DataNode::load_root(&ctx).unwrap()
    }

    #[test]
    fn test_child_set_reindexes_after_remove() {
        let root = root();
        for name in ["a", "b", "c", "d"] {
            root.get_or_create_child(name).unwrap();
        }
        let mut set = ChildSet::default();
        for child in root.children().unwrap() {
            set.insert(child);
        }

        let removed = set.remove(Identifier::from_name("b")).unwrap();
        assert_eq!(removed.name(), "b");
        assert_eq!(set.len(), 3);
        for name in ["a", "c", "d"] {
            assert_eq!(set.get(Identifier::from_name(name)).unwrap().name(), name);
        }
        assert!(set.remove(Identifier::from_name("b")).is_none());

        let all = set.take_all();
        assert_eq!(all.len(), 3);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_manifest_encoding() {
        let manifest = NodeManifest {
            name: "users".into(),
            slots: vec![(1, 17), (4, 9)],
            children: vec![("ada".into(), 3), ("bob".into(), 5)],
        };
        let bytes = manifest.encode().unwrap();
        assert_eq!(NodeManifest::decode(&bytes).unwrap(), manifest);

        let err = NodeManifest::decode(&[0xc1]).unwrap_err();
        assert_eq!(err.code(), crystal_core::ResultCode::DeserializeError);
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("plain").is_ok());
        assert!(validate_name("with space").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
    }

    #[test]
    fn test_root_identity() {
        let root = root();
        assert!(root.is_root());
        assert_eq!(root.name(), "");
        assert_eq!(root.path(), "/");
        assert!(root.parent().is_none());
        assert!(!root.manifest_id().is_assigned());
    }

    #[test]
    fn test_child_links_to_parent() {
        let root = root();
        let a = root.get_or_create_child("a").unwrap();
        let b = a.get_or_create_child("b").unwrap();

        assert!(Arc::ptr_eq(&b.parent().unwrap(), &a));
        assert_eq!(b.id(), Identifier::from_name("b"));
        assert!(Arc::ptr_eq(
            &root.child_by_id(Identifier::from_name("a")).unwrap().unwrap(),
            &a
        ));
        assert!(Arc::ptr_eq(
            &root.descendant(["a", "b"]).unwrap().unwrap(),
            &b
        ));
        assert!(Arc::ptr_eq(
            &root.descendant(Vec::<String>::new()).unwrap().unwrap(),
            &root
        ));
    }

    #[test]
    fn test_delete_retires_nothing_unsaved() {
        let root = root();
        let a = root.get_or_create_child("a").unwrap();
        a.set_buffer(DatumTag(9), SharedBuffer::from_vec(vec![1, 2, 3]))
            .unwrap();
        assert!(root.delete_child("a").unwrap());
        assert!(a.is_removed());
        assert!(a.datum_tags().is_err());
        assert_eq!(root.ctx.retired_count(), 0);
    }

    #[test]
    fn test_manifest_lists_saved_content_only() {
        let root = root();
        let a = root.get_or_create_child("a").unwrap();
        a.set_buffer(DatumTag(2), SharedBuffer::from_vec(vec![7]))
            .unwrap();
        let manifest = {
            let inner = a.inner.read();
            a.manifest(&inner)
        };
        assert_eq!(manifest.name, "a");
        assert!(manifest.slots.is_empty());
        assert!(manifest.children.is_empty());
    }

    #[test]
    fn test_save_moves_content_to_fresh_handles() {
        let root = root();
        let a = root.get_or_create_child("a").unwrap();
        a.set_buffer(DatumTag(2), SharedBuffer::from_vec(vec![1]))
            .unwrap();
        root.save(true, false).unwrap();
        let unit = a.datum(DatumTag(2)).unwrap().unwrap();
        let first_unit = unit.file_id();
        let first_manifest = a.manifest_id();
        assert!(first_unit.is_assigned());
        assert!(first_manifest.is_assigned());
        assert_eq!(root.ctx.retired_count(), 0);

        a.set_buffer(DatumTag(2), SharedBuffer::from_vec(vec![2]))
            .unwrap();
        root.save(true, false).unwrap();
        assert_ne!(unit.file_id(), first_unit);
        assert_ne!(a.manifest_id(), first_manifest);
        // The unit, a's manifest and the root manifest
        assert_eq!(root.ctx.retired_count(), 3);
    }

    #[test]
    fn test_failed_unit_does_not_stop_siblings() {
        let storage = RefusingStorage(NullStorage::new());
        storage.prepare_and_check(true).unwrap();
        let ctx = TreeContext::over_storage(Arc::new(storage), DatumRegistry::new());
        let root = DataNode::load_root(&ctx).unwrap();
        let bad = root.get_or_create_child("bad").unwrap();
        let good = root.get_or_create_child("good").unwrap();
        bad.set_buffer(DatumTag(1), SharedBuffer::from_vec(vec![0xEE]))
            .unwrap();
        bad.set_buffer(DatumTag(2), SharedBuffer::from_vec(vec![1]))
            .unwrap();
        good.set_buffer(DatumTag(1), SharedBuffer::from_vec(vec![2]))
            .unwrap();

        let err = root.save(true, false).unwrap_err();
        assert!(matches!(err, CrystalError::FileError(_)));

        fn handle(node: &DataNode, tag: u8) -> FileId {
            node.datum(DatumTag(tag)).unwrap().unwrap().file_id()
        }
        assert!(!handle(&bad, 1).is_assigned());
        assert!(bad.datum(DatumTag(1)).unwrap().unwrap().is_dirty());
        assert!(handle(&bad, 2).is_assigned());
        assert!(handle(&good, 1).is_assigned());
        assert!(bad.manifest_id().is_assigned());
        assert!(root.manifest_id().is_assigned());
    }
}
