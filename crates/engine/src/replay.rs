//! Journal replay
//!
//! Applies the records a [`RecoveryScan`] selects to a freshly loaded tree.
//! Every record is an idempotent "set": creating an existing node, deleting a
//! missing one or writing equal content changes nothing, so records that
//! overlap the last save are harmless.
//!
//! Writes to nodes that do not exist are skipped. A node's creation is always
//! journaled before any write to it, so a missing node was deleted later.

use crate::context::TreeContext;
use crate::node::DataNode;
use crate::record::TreeRecord;
use crystal_core::CrystalResult;
use crystal_durability::RecoveryScan;
use std::sync::Arc;
use tracing::{info, warn};

/// Replay counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records that changed or confirmed tree state
    pub applied: usize,
    /// Records naming nodes that no longer exist
    pub skipped: usize,
    /// Records that failed to decode or apply
    pub failed: usize,
}

/// Replay `scan` onto `root` without journaling the replayed operations
pub(crate) fn replay(ctx: &TreeContext, root: &Arc<DataNode>, scan: &RecoveryScan) -> ReplayStats {
    let mut stats = ReplayStats::default();
    ctx.set_replaying(true);
    for record in scan.replay_records() {
        let outcome = TreeRecord::decode(record.record_type, &record.payload, &ctx.pool)
            .and_then(|decoded| apply(root, &decoded));
        match outcome {
            Ok(true) => stats.applied += 1,
            Ok(false) => stats.skipped += 1,
            Err(e) => {
                warn!(waypoint = %record.waypoint, record_type = record.record_type, error = %e, "Failed to replay journal record");
                stats.failed += 1;
            }
        }
    }
    ctx.set_replaying(false);
    if stats != ReplayStats::default() {
        info!(
            applied = stats.applied,
            skipped = stats.skipped,
            failed = stats.failed,
            "Journal replay complete"
        );
    }
    stats
}

/// Apply one record; false when its node is gone
pub(crate) fn apply(root: &Arc<DataNode>, record: &TreeRecord) -> CrystalResult<bool> {
    match record {
        TreeRecord::NodeCreate { path } => {
            let mut node = Arc::clone(root);
            for name in path {
                node = node.get_or_create_child(name)?;
            }
            Ok(true)
        }
        TreeRecord::NodeDelete { path } => match path.split_last() {
            Some((last, parents)) => match root.descendant(parents)? {
                Some(parent) => {
                    parent.delete_child(last)?;
                    Ok(true)
                }
                None => Ok(false),
            },
            None => Ok(false),
        },
        TreeRecord::DatumWrite { path, tag, bytes } => match root.descendant(path)? {
            Some(node) => {
                node.set_buffer(*tag, bytes.share())?;
                Ok(true)
            }
            None => Ok(false),
        },
        TreeRecord::DatumDelete { path, tag } => match root.descendant(path)? {
            Some(node) => {
                node.delete_datum(*tag)?;
                Ok(true)
            }
            None => Ok(false),
        },
        TreeRecord::DatumBind { path, tag, file_id } => match root.descendant(path)? {
            Some(node) => {
                node.bind_datum(*tag, *file_id)?;
                Ok(true)
            }
            None => Ok(false),
        },
    }
}
