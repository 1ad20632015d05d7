//! Datum type registry
//!
//! Maps each [`DatumTag`] to the Rust type stored under it and, optionally, a
//! constructor that produces the initial value of an empty unit. The registry
//! is built before the coordinator starts and shared read-only afterwards.

use crate::datum::encode_value;
use crate::node::DataNode;
use crystal_core::{CrystalError, CrystalResult, DatumTag, SharedBuffer};
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// A value that can live in a data unit.
///
/// Values are encoded with MessagePack. `PartialEq` lets a write of an equal
/// value leave the unit clean.
pub trait DatumValue: Serialize + DeserializeOwned + PartialEq + Send + Sync + 'static {
    /// Slot tag; one type per tag in a registry
    const TYPE_TAG: DatumTag;
}

/// Freshly constructed value with its encoding
pub(crate) struct Constructed {
    pub(crate) value: Arc<dyn Any + Send + Sync>,
    pub(crate) encoded: SharedBuffer,
}

type ConstructFn = dyn Fn(&DataNode) -> CrystalResult<Constructed> + Send + Sync;

/// Registration of one tag
pub struct DatumDescriptor {
    tag: DatumTag,
    type_id: TypeId,
    type_name: &'static str,
    construct: Option<Box<ConstructFn>>,
}

impl DatumDescriptor {
    /// Registered tag
    pub fn tag(&self) -> DatumTag {
        self.tag
    }

    /// Name of the registered type
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether empty units of this tag get a constructed value
    pub fn has_constructor(&self) -> bool {
        self.construct.is_some()
    }

    pub(crate) fn construct(&self, node: &DataNode) -> Option<CrystalResult<Constructed>> {
        self.construct.as_ref().map(|f| f(node))
    }
}

impl fmt::Debug for DatumDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatumDescriptor")
            .field("tag", &self.tag)
            .field("type_name", &self.type_name)
            .field("has_constructor", &self.has_constructor())
            .finish()
    }
}

/// Tag to type map
#[derive(Debug, Default)]
pub struct DatumRegistry {
    entries: FxHashMap<DatumTag, DatumDescriptor>,
}

impl DatumRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` without a constructor; empty units report `NoData`.
    pub fn register<T: DatumValue>(&mut self) -> CrystalResult<()> {
        self.insert::<T>(None)
    }

    /// Register `T` with a constructor for empty units.
    ///
    /// The constructor runs while the unit is locked and must not touch the
    /// unit it is building.
    pub fn register_with<T, F>(&mut self, construct: F) -> CrystalResult<()>
    where
        T: DatumValue,
        F: Fn(&DataNode) -> T + Send + Sync + 'static,
    {
        let construct: Box<ConstructFn> = Box::new(move |node: &DataNode| {
            let value = construct(node);
            let encoded = encode_value(&value)?;
            Ok(Constructed {
                value: Arc::new(value),
                encoded,
            })
        });
        self.insert::<T>(Some(construct))
    }

    fn insert<T: DatumValue>(&mut self, construct: Option<Box<ConstructFn>>) -> CrystalResult<()> {
        let type_name = std::any::type_name::<T>();
        if let Some(existing) = self.entries.get(&T::TYPE_TAG) {
            if existing.type_id != TypeId::of::<T>() {
                return Err(CrystalError::invalid_argument(format!(
                    "{} already registered to {}, cannot register {}",
                    T::TYPE_TAG,
                    existing.type_name,
                    type_name
                )));
            }
        }
        self.entries.insert(
            T::TYPE_TAG,
            DatumDescriptor {
                tag: T::TYPE_TAG,
                type_id: TypeId::of::<T>(),
                type_name,
                construct,
            },
        );
        Ok(())
    }

    /// Registration of `tag`
    pub fn descriptor(&self, tag: DatumTag) -> Option<&DatumDescriptor> {
        self.entries.get(&tag)
    }

    /// Fails with `InvalidCast` when `T::TYPE_TAG` is registered to another type
    pub fn check<T: DatumValue>(&self) -> CrystalResult<()> {
        match self.entries.get(&T::TYPE_TAG) {
            Some(d) if d.type_id != TypeId::of::<T>() => Err(CrystalError::InvalidCast {
                expected: std::any::type_name::<T>().to_string(),
                found: d.type_name.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Number of registered tags
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Counter(u64);

    impl DatumValue for Counter {
        const TYPE_TAG: DatumTag = DatumTag(1);
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Imposter(String);

    impl DatumValue for Imposter {
        const TYPE_TAG: DatumTag = DatumTag(1);
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = DatumRegistry::new();
        assert!(registry.is_empty());
        registry.register::<Counter>().unwrap();

        let descriptor = registry.descriptor(DatumTag(1)).unwrap();
        assert!(descriptor.type_name().ends_with("Counter"));
        assert!(!descriptor.has_constructor());
        assert!(registry.descriptor(DatumTag(2)).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_conflicting_registration_rejected() {
        let mut registry = DatumRegistry::new();
        registry.register::<Counter>().unwrap();
        // Same type again is fine
        registry.register_with::<Counter, _>(|_| Counter(7)).unwrap();
        assert!(registry.descriptor(DatumTag(1)).unwrap().has_constructor());

        let err = registry.register::<Imposter>().unwrap_err();
        assert!(matches!(err, CrystalError::InvalidArgument(_)));
    }

    #[test]
    fn test_check_reports_invalid_cast() {
        let mut registry = DatumRegistry::new();
        registry.register::<Counter>().unwrap();
        assert!(registry.check::<Counter>().is_ok());
        assert!(matches!(
            registry.check::<Imposter>(),
            Err(CrystalError::InvalidCast { .. })
        ));
    }
}
