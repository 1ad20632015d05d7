//! Record writer handed out by a journal.

use crystal_core::limits::MAX_RECORD_PAYLOAD;
use crystal_core::{BufferOwner, BufferPool};
use std::io;

/// Scratch buffer for one journal record
///
/// Obtained from [`Journal::get_writer`](crate::Journal::get_writer), filled
/// through [`io::Write`], and consumed by
/// [`Journal::add_record`](crate::Journal::add_record). The scratch space is
/// rented from the buffer pool and goes back when the writer is dropped.
pub struct JournalWriter {
    record_type: u8,
    scratch: BufferOwner,
}

impl JournalWriter {
    /// Create a writer for `record_type` with pooled scratch space
    pub fn new(record_type: u8, pool: &BufferPool) -> Self {
        JournalWriter {
            record_type,
            scratch: pool.rent(MAX_RECORD_PAYLOAD),
        }
    }

    /// Record type tag
    pub fn record_type(&self) -> u8 {
        self.record_type
    }

    /// Payload written so far
    pub fn payload(&self) -> &[u8] {
        self.scratch.as_slice()
    }

    /// Payload length
    pub fn len(&self) -> usize {
        self.scratch.len()
    }

    /// Whether no payload has been written
    pub fn is_empty(&self) -> bool {
        self.scratch.is_empty()
    }
}

impl io::Write for JournalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.scratch.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for JournalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalWriter")
            .field("record_type", &self.record_type)
            .field("len", &self.len())
            .finish()
    }
}
