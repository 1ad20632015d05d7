//! Crystal - embedded hierarchical object-persistence engine
//!
//! Applications keep a tree of named nodes; each node carries typed data
//! units. The engine persists the tree to an object store, journals every
//! mutation so unsaved work survives a crash, and unloads cold data to bound
//! memory.
//!
//! # Quick Start
//!
//! ```ignore
//! use crystal::{Crystal, DatumRegistry, StartParam};
//!
//! let crystal = Crystal::open("./data", DatumRegistry::new())?;
//! crystal.start(StartParam::resume());
//! let node = crystal.root()?.get_or_create_child("settings")?;
//! node.set(Theme::Dark)?;
//! crystal.crystallize()?;
//! ```

pub use crystal_engine::*;
