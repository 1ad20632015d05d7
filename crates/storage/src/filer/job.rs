//! Filer work items and completion tickets

use crystal_core::{CrystalError, CrystalResult, SharedBuffer, Wait};
use parking_lot::{Condvar, Mutex};
use std::path::PathBuf;
use std::sync::Arc;

/// Kind of queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Byte-range write
    Write,
    /// Byte-range read
    Read,
    /// Single file removal
    Delete,
    /// Removal of every file
    DeleteAll,
}

/// One queued operation
///
/// Two jobs are equal when kind, path, offset, payload bytes and length match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilerJob {
    pub(crate) kind: JobKind,
    pub(crate) path: PathBuf,
    pub(crate) offset: u64,
    pub(crate) payload: Option<SharedBuffer>,
    pub(crate) length: usize,
}

impl FilerJob {
    pub(crate) fn write(path: PathBuf, offset: u64, payload: SharedBuffer) -> Self {
        let length = payload.len();
        FilerJob {
            kind: JobKind::Write,
            path,
            offset,
            payload: Some(payload),
            length,
        }
    }

    pub(crate) fn read(path: PathBuf, offset: u64, length: usize) -> Self {
        FilerJob {
            kind: JobKind::Read,
            path,
            offset,
            payload: None,
            length,
        }
    }

    pub(crate) fn delete(path: PathBuf) -> Self {
        FilerJob {
            kind: JobKind::Delete,
            path,
            offset: 0,
            payload: None,
            length: 0,
        }
    }

    pub(crate) fn delete_all() -> Self {
        FilerJob {
            kind: JobKind::DeleteAll,
            path: PathBuf::new(),
            offset: 0,
            payload: None,
            length: 0,
        }
    }

    /// Kind of this job
    pub fn kind(&self) -> JobKind {
        self.kind
    }
}

/// Result of a completed job: reads carry a buffer, everything else `None`
pub type FilerOutcome = CrystalResult<Option<SharedBuffer>>;

struct TicketSlot {
    outcome: Mutex<Option<FilerOutcome>>,
    done: Condvar,
}

/// Handle to a queued job's eventual outcome
///
/// Coalesced submissions receive clones of the same ticket.
#[derive(Clone)]
pub struct FilerTicket {
    slot: Arc<TicketSlot>,
}

impl FilerTicket {
    pub(crate) fn pending() -> Self {
        FilerTicket {
            slot: Arc::new(TicketSlot {
                outcome: Mutex::new(None),
                done: Condvar::new(),
            }),
        }
    }

    pub(crate) fn resolved(outcome: FilerOutcome) -> Self {
        let ticket = Self::pending();
        ticket.complete(outcome);
        ticket
    }

    pub(crate) fn complete(&self, outcome: FilerOutcome) {
        let mut slot = self.slot.outcome.lock();
        *slot = Some(outcome);
        self.slot.done.notify_all();
    }

    /// Whether the job has finished
    pub fn is_complete(&self) -> bool {
        self.slot.outcome.lock().is_some()
    }

    /// Whether two tickets track the same job
    pub fn same_job(&self, other: &FilerTicket) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// Wait for the outcome; `Timeout` leaves the job running
    pub fn wait(&self, wait: Wait) -> FilerOutcome {
        let mut slot = self.slot.outcome.lock();
        match wait.deadline() {
            None => {
                while slot.is_none() {
                    self.slot.done.wait(&mut slot);
                }
            }
            Some(deadline) => {
                while slot.is_none() {
                    if self.slot.done.wait_until(&mut slot, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        slot.clone().unwrap_or(Err(CrystalError::Timeout))
    }

    /// Wait and discard any read payload
    pub fn wait_done(&self, wait: Wait) -> CrystalResult<()> {
        self.wait(wait).map(|_| ())
    }
}

impl std::fmt::Debug for FilerTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilerTicket")
            .field("complete", &self.is_complete())
            .finish()
    }
}
