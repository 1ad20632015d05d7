//! No-op journal, installed when journaling is disabled.

use crate::journal::{BookState, CheckpointMark, Journal, Waypoint};
use crate::recovery::RecoveryScan;
use crate::writer::JournalWriter;
use crystal_core::limits::MAX_RECORD_PAYLOAD;
use crystal_core::{BufferPool, CrystalError, CrystalResult, Wait};

/// Journal that accepts records and keeps none
#[derive(Debug, Clone)]
pub struct NullJournal {
    pool: BufferPool,
}

impl NullJournal {
    /// Create a null journal drawing scratch space from `pool`
    pub fn new(pool: BufferPool) -> Self {
        NullJournal { pool }
    }
}

impl Default for NullJournal {
    fn default() -> Self {
        Self::new(BufferPool::global().clone())
    }
}

impl Journal for NullJournal {
    fn prepare(&self) -> CrystalResult<RecoveryScan> {
        Ok(RecoveryScan::empty())
    }

    fn repair(&self, _scan: &RecoveryScan) -> CrystalResult<()> {
        Ok(())
    }

    fn get_writer(&self, record_type: u8) -> JournalWriter {
        JournalWriter::new(record_type, &self.pool)
    }

    fn add_record(&self, writer: JournalWriter) -> CrystalResult<Waypoint> {
        // Same limit as the file journal so behavior does not depend on the backend.
        if writer.len() > MAX_RECORD_PAYLOAD {
            return Err(CrystalError::OverSizeLimit {
                size: writer.len(),
                limit: MAX_RECORD_PAYLOAD,
            });
        }
        Ok(Waypoint::NONE)
    }

    fn begin_checkpoint(&self) -> CrystalResult<CheckpointMark> {
        Ok(CheckpointMark {
            number: 0,
            waypoint: Waypoint::NONE,
        })
    }

    fn complete_checkpoint(&self, _mark: CheckpointMark, _wait: Wait) -> CrystalResult<()> {
        Ok(())
    }

    fn flush(&self, _wait: Wait) -> CrystalResult<()> {
        Ok(())
    }

    fn close(&self) -> CrystalResult<()> {
        Ok(())
    }

    fn abort(&self) {}

    fn is_durable(&self) -> bool {
        false
    }

    fn resident_bytes(&self) -> u64 {
        0
    }

    fn book_states(&self) -> Vec<(u64, BookState)> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_null_journal_accepts_without_waypoints() {
        let journal = NullJournal::new(BufferPool::new(2));
        assert!(journal.prepare().unwrap().is_empty());

        let mut writer = journal.get_writer(1);
        writer.write_all(b"ignored").unwrap();
        assert_eq!(journal.add_record(writer).unwrap(), Waypoint::NONE);
        assert!(!journal.is_durable());
        assert!(journal.book_states().is_empty());
    }

    #[test]
    fn test_null_journal_still_rejects_oversize() {
        let journal = NullJournal::default();
        let mut writer = journal.get_writer(1);
        writer.write_all(&vec![0u8; MAX_RECORD_PAYLOAD + 1]).unwrap();
        assert!(matches!(
            journal.add_record(writer),
            Err(CrystalError::OverSizeLimit { .. })
        ));
    }
}
