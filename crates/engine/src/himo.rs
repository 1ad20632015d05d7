//! Himo: the resident-data cache
//!
//! Tracks every data unit that holds content in memory and unloads units to
//! keep resident bytes bounded.
//!
//! # Eviction cycle
//!
//! Access stamps the current epoch on a unit; each [`Himo::sweep`] advances
//! the epoch. A sweep
//!
//! 1. unloads every unit not accessed since the previous sweep, then
//! 2. while resident bytes exceed the limit, unloads the least recently
//!    accessed units first.
//!
//! Dirty units are saved before they are unloaded. When storage is not
//! persistent a dirty unit has nowhere to go and stays resident.

use crate::config::HimoConfig;
use crate::context::TreeContext;
use crate::datum::DataUnit;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Outcome of one eviction cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Units unloaded because they went unused for a whole cycle
    pub idle_unloaded: usize,
    /// Units unloaded to get under the memory limit
    pub pressure_unloaded: usize,
    /// Units left resident because they were busy, dirty without persistent
    /// storage, or failed to save
    pub kept: usize,
    /// Bytes released
    pub bytes_freed: u64,
}

/// Resident-unit registry and byte counter
pub struct Himo {
    units: Mutex<Vec<Weak<DataUnit>>>,
    resident_bytes: AtomicU64,
    epoch: AtomicU64,
    memory_size_limit: u64,
}

impl Himo {
    /// Cache bounded by `config.memory_size_limit`
    pub fn new(config: &HimoConfig) -> Self {
        Himo {
            units: Mutex::new(Vec::new()),
            resident_bytes: AtomicU64::new(0),
            epoch: AtomicU64::new(1),
            memory_size_limit: config.memory_size_limit,
        }
    }

    /// Resident payload bytes
    pub fn memory_usage(&self) -> u64 {
        self.resident_bytes.load(Ordering::Acquire)
    }

    /// Number of units holding content
    pub fn resident_count(&self) -> usize {
        self.units
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|unit| unit.resident_size() > 0)
            .count()
    }

    /// Configured limit
    pub fn memory_size_limit(&self) -> u64 {
        self.memory_size_limit
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn track(&self, unit: &Arc<DataUnit>) {
        if unit.mark_tracked() {
            self.units.lock().push(Arc::downgrade(unit));
        }
    }

    pub(crate) fn adjust(&self, old: u64, new: u64) {
        if new > old {
            self.resident_bytes.fetch_add(new - old, Ordering::AcqRel);
        } else if old > new {
            self.resident_bytes.fetch_sub(old - new, Ordering::AcqRel);
        }
    }

    /// Run one eviction cycle
    pub(crate) fn sweep(&self, ctx: &TreeContext) -> SweepStats {
        let current = self.epoch.fetch_add(1, Ordering::AcqRel);

        let mut live = Vec::new();
        self.units.lock().retain(|weak| match weak.upgrade() {
            Some(unit) => {
                live.push(unit);
                true
            }
            None => false,
        });

        let mut stats = SweepStats::default();
        let mut recent = Vec::with_capacity(live.len());
        for unit in live {
            if unit.resident_size() == 0 {
                continue;
            }
            if unit.last_access() >= current {
                recent.push(unit);
                continue;
            }
            match evict(&unit, ctx) {
                Some(freed) => {
                    stats.idle_unloaded += 1;
                    stats.bytes_freed += freed;
                }
                None => {
                    stats.kept += 1;
                    recent.push(unit);
                }
            }
        }

        if self.memory_usage() > self.memory_size_limit {
            recent.sort_by_key(|unit| unit.last_access());
            for unit in recent {
                if self.memory_usage() <= self.memory_size_limit {
                    break;
                }
                match evict(&unit, ctx) {
                    Some(freed) => {
                        stats.pressure_unloaded += 1;
                        stats.bytes_freed += freed;
                    }
                    None => stats.kept += 1,
                }
            }
        }

        debug!(
            epoch = current,
            idle = stats.idle_unloaded,
            pressure = stats.pressure_unloaded,
            kept = stats.kept,
            freed = stats.bytes_freed,
            resident = self.memory_usage(),
            "Himo sweep complete"
        );
        stats
    }
}

fn evict(unit: &Arc<DataUnit>, ctx: &TreeContext) -> Option<u64> {
    match unit.try_unload(ctx) {
        Ok(freed) => freed,
        Err(e) => {
            warn!(tag = %unit.tag(), error = %e, "Failed to save datum before unloading");
            None
        }
    }
}

impl std::fmt::Debug for Himo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Himo")
            .field("resident_bytes", &self.memory_usage())
            .field("memory_size_limit", &self.memory_size_limit)
            .finish()
    }
}
