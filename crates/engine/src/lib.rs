//! Crystal engine
//!
//! This crate assembles the lower layers into the running system:
//! - Crystal: coordinator with start, crystallize, stop and abort
//! - DataNode / DataUnit: the hierarchical data tree and its typed slots
//! - DatumRegistry: datum types and their constructors
//! - Himo: resident-data cache with background eviction
//! - Journal records and replay of unsaved mutations
//! - Configuration via `crystal.toml`
//!
//! The engine is the only component that knows about:
//! - The tree layout and its manifests
//! - Crystallization policy
//! - Cross-layer coordination (storage + journal + replay)

#![warn(missing_docs)]
#![warn(clippy::all)]

mod background;
pub mod config;
mod context;
pub mod coordinator;
pub mod datum;
pub mod himo;
pub mod node;
pub mod record;
pub mod registry;
pub mod replay;
pub mod user_query;

pub use config::{ConfigError, CrystalConfig, CrystallizationPolicy, HimoConfig, CONFIG_FILE_NAME};
pub use coordinator::{Crystal, CrystalState, StartParam, StartResult, StopParam, StopResult};
pub use datum::{DataUnit, MemoryObject};
pub use himo::{Himo, SweepStats};
pub use node::DataNode;
pub use record::TreeRecord;
pub use registry::{DatumDescriptor, DatumRegistry, DatumValue};
pub use replay::ReplayStats;
pub use user_query::{NonInteractive, QueryAnswer, UserQuery};

pub use crystal_core::{
    CrystalError, CrystalResult, DatumTag, FileId, Identifier, ResultCode, SharedBuffer, Wait,
};
