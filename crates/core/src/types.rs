//! Identifier and handle types
//!
//! - [`Identifier`]: name-derived 64-bit key of a tree node
//! - [`FileId`]: opaque storage handle, `0` means unassigned
//! - [`DatumTag`]: small integer discriminating data-unit types

use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::xxh3_64;

/// Fixed-width key of a node, unique among its siblings
///
/// Derived from the node name with xxh3, so the same name always maps to the
/// same identifier across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier(pub u64);

impl Identifier {
    /// Derive the identifier of a node name
    pub fn from_name(name: &str) -> Self {
        Identifier(xxh3_64(name.as_bytes()))
    }

    /// Raw value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Storage handle of a persisted payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl FileId {
    /// Handle of something never written
    pub const UNASSIGNED: FileId = FileId(0);

    /// Whether storage has assigned this handle
    pub fn is_assigned(&self) -> bool {
        self.0 != 0
    }

    /// Raw value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Type tag of a data-unit slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatumTag(pub u8);

impl DatumTag {
    /// Raw value
    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for DatumTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "datum:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_is_stable() {
        assert_eq!(Identifier::from_name("users"), Identifier::from_name("users"));
        assert_ne!(Identifier::from_name("users"), Identifier::from_name("Users"));
    }

    #[test]
    fn test_file_id_assignment() {
        assert!(!FileId::UNASSIGNED.is_assigned());
        assert!(!FileId::default().is_assigned());
        assert!(FileId(7).is_assigned());
    }

    #[test]
    fn test_display() {
        assert_eq!(FileId(12).to_string(), "#12");
        assert_eq!(DatumTag(3).to_string(), "datum:3");
        assert_eq!(Identifier(0xab).to_string(), "00000000000000ab");
    }
}
