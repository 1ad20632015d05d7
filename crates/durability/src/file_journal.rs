//! Book-based journal on disk.
//!
//! Records are framed into the pending buffer of the active book. Pending
//! bytes are handed to the journal's filer as one write job when they reach
//! `chunk_size`, when the book is sealed, or on `flush`. Until the filer
//! acknowledges a job its bytes count as resident; once resident bytes would
//! pass `max_resident_bytes`, `add_record` waits for the oldest job.
//!
//! Old books are never appended to: every process start begins a new book
//! after the ones found on disk.

use crate::config::JournalConfig;
use crate::format::{
    book_file_name, encode_frame, parse_book_file_name, BookHeader, BOOK_HEADER_SIZE,
    BOOK_PATTERN, FRAME_OVERHEAD,
};
use crate::journal::{
    is_reserved_type, BookState, CheckpointMark, Journal, Waypoint, CHECKPOINT_BEGIN,
    CHECKPOINT_END,
};
use crate::recovery::{
    encode_marker, scan_book, BookRepair, RecoveryScan, ScanStop, ScannedBook,
};
use crate::writer::JournalWriter;
use crystal_core::limits::MAX_RECORD_PAYLOAD;
use crystal_core::{BufferOwner, BufferPool, CrystalError, CrystalResult, Wait};
use crystal_storage::{Filer, FilerConfig, FilerTicket, TO_END};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct Book {
    sequence: u64,
    path: PathBuf,
    state: BookState,
    /// Logical size, including pending bytes
    size: u64,
    pending: Option<BufferOwner>,
    /// File offset of the first pending byte
    pending_offset: u64,
    in_flight: VecDeque<(FilerTicket, u64)>,
    removal: Option<FilerTicket>,
}

impl Book {
    fn create(sequence: u64, store_uuid: [u8; 16], pool: &BufferPool, chunk: usize) -> Self {
        let mut pending = pool.rent(chunk);
        pending.extend_from_slice(&BookHeader::new(sequence, store_uuid).to_bytes());
        Book {
            sequence,
            path: PathBuf::from(book_file_name(sequence)),
            state: BookState::Active,
            size: BOOK_HEADER_SIZE as u64,
            pending: Some(pending),
            pending_offset: 0,
            in_flight: VecDeque::new(),
            removal: None,
        }
    }

    fn recovered(sequence: u64, path: PathBuf, size: u64) -> Self {
        Book {
            sequence,
            path,
            state: BookState::Flushed,
            size,
            pending: None,
            pending_offset: size,
            in_flight: VecDeque::new(),
            removal: None,
        }
    }

    fn pending_len(&self) -> u64 {
        self.pending.as_ref().map_or(0, |p| p.len() as u64)
    }

    /// Hand pending bytes to the filer
    fn submit(&mut self, filer: &Filer) {
        if let Some(pending) = self.pending.take() {
            if pending.is_empty() {
                return;
            }
            let len = pending.len() as u64;
            let ticket = filer.write(self.path.clone(), self.pending_offset, pending.freeze());
            self.pending_offset += len;
            self.in_flight.push_back((ticket, len));
        }
    }

    /// Drop acknowledged jobs; returns the bytes released
    fn reap(&mut self, failure: &mut Option<CrystalError>) -> u64 {
        let mut freed = 0;
        while let Some((ticket, len)) = self.in_flight.front() {
            if !ticket.is_complete() {
                break;
            }
            if let Err(e) = ticket.wait_done(Wait::NoWait) {
                warn!(book = self.sequence, error = %e, "Journal book write failed");
                failure.get_or_insert(e);
            }
            freed += *len;
            self.in_flight.pop_front();
        }
        if self.state == BookState::Sealed
            && self.pending.is_none()
            && self.in_flight.is_empty()
            && failure.is_none()
        {
            self.state = BookState::Flushed;
            debug!(book = self.sequence, size = self.size, "Journal book flushed");
        }
        freed
    }
}

struct JournalState {
    open: bool,
    store_uuid: [u8; 16],
    books: VecDeque<Book>,
    next_sequence: u64,
    next_checkpoint: u64,
    resident: u64,
    failure: Option<CrystalError>,
}

impl JournalState {
    fn closed() -> Self {
        JournalState {
            open: false,
            store_uuid: [0u8; 16],
            books: VecDeque::new(),
            next_sequence: 1,
            next_checkpoint: 1,
            resident: 0,
            failure: None,
        }
    }

    fn reap(&mut self) {
        let mut freed = 0;
        for book in self.books.iter_mut() {
            freed += book.reap(&mut self.failure);
        }
        self.resident = self.resident.saturating_sub(freed);
        self.books.retain(|book| {
            !(book.state == BookState::Recyclable
                && book.removal.as_ref().map_or(true, FilerTicket::is_complete))
        });
    }

    fn submit_all(&mut self, filer: &Filer) {
        for book in self.books.iter_mut() {
            book.submit(filer);
        }
    }

    fn in_flight_tickets(&self) -> Vec<FilerTicket> {
        self.books
            .iter()
            .flat_map(|b| b.in_flight.iter().map(|(t, _)| t.clone()))
            .collect()
    }
}

/// Journal keeping books in a directory
pub struct FileJournal {
    filer: Filer,
    config: JournalConfig,
    pool: BufferPool,
    state: Mutex<JournalState>,
}

impl FileJournal {
    /// Create a journal over `dir`; nothing touches disk until `prepare`
    pub fn new(
        dir: impl Into<PathBuf>,
        filer_config: &FilerConfig,
        config: JournalConfig,
        pool: BufferPool,
    ) -> Self {
        FileJournal {
            filer: Filer::local("journal", dir, filer_config.sync_writes, pool.clone()),
            config,
            pool,
            state: Mutex::new(JournalState::closed()),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    fn scratch_size(&self) -> usize {
        self.config.chunk_size as usize + FRAME_OVERHEAD + MAX_RECORD_PAYLOAD
    }

    /// Replace a book with its valid prefix
    fn rewrite_prefix(&self, path: &Path, prefix: &[u8]) -> CrystalResult<()> {
        self.filer.delete_wait(path, Wait::Infinite)?;
        if !prefix.is_empty() {
            self.filer
                .write_wait(path, 0, self.pool.copy_from(prefix), Wait::Infinite)?;
        }
        Ok(())
    }

    /// Seal the active book and start the next one
    fn rotate(&self, state: &mut JournalState) {
        if let Some(active) = state.books.back_mut() {
            if active.state == BookState::Active {
                active.state = BookState::Sealed;
                active.submit(&self.filer);
                debug!(book = active.sequence, size = active.size, "Sealed journal book");
            }
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let book = Book::create(sequence, state.store_uuid, &self.pool, self.scratch_size());
        state.resident += BOOK_HEADER_SIZE as u64;
        state.books.push_back(book);
        info!(book = sequence, "Started journal book");
    }

    /// Wait for the filer until `needed` more bytes fit under the cap
    fn reserve(&self, state: &mut JournalState, needed: u64) {
        loop {
            state.reap();
            if state.resident + needed <= self.config.max_resident_bytes {
                return;
            }
            state.submit_all(&self.filer);
            let oldest = state
                .books
                .iter()
                .find_map(|b| b.in_flight.front().map(|(t, _)| t.clone()));
            match oldest {
                Some(ticket) => {
                    debug!(resident = state.resident, "Journal memory full, waiting for flush");
                    let _ = ticket.wait(Wait::Infinite);
                }
                None => return,
            }
        }
    }

    fn append_locked(
        &self,
        state: &mut JournalState,
        record_type: u8,
        payload: &[u8],
    ) -> CrystalResult<Waypoint> {
        if let Some(e) = &state.failure {
            return Err(e.clone());
        }
        let frame_len = (FRAME_OVERHEAD + payload.len()) as u64;
        self.reserve(state, frame_len + BOOK_HEADER_SIZE as u64);

        let needs_rotation = match state.books.back() {
            Some(book) => {
                book.state != BookState::Active || book.size + frame_len > self.config.book_size
            }
            None => true,
        };
        if needs_rotation {
            self.rotate(state);
        }

        let scratch = self.scratch_size();
        let book = match state.books.back_mut() {
            Some(book) => book,
            None => return Err(CrystalError::FileError("journal has no active book".into())),
        };
        let offset = book.size;
        let pending = book.pending.get_or_insert_with(|| self.pool.rent(scratch));
        encode_frame(record_type, payload, pending)?;
        book.size += frame_len;
        state.resident += frame_len;

        if book.pending_len() >= self.config.chunk_size {
            book.submit(&self.filer);
        }
        Ok(Waypoint {
            book: book.sequence,
            offset,
        })
    }

    fn open_state(&self) -> CrystalResult<parking_lot::MutexGuard<'_, JournalState>> {
        let state = self.state.lock();
        if state.open {
            Ok(state)
        } else {
            Err(CrystalError::NotStarted)
        }
    }
}

/// Wait for every ticket under one deadline
fn wait_all(tickets: &[FilerTicket], wait: Wait) -> CrystalResult<()> {
    let deadline = wait.deadline();
    for ticket in tickets {
        let remaining = match deadline {
            None => Wait::Infinite,
            Some(deadline) => Wait::Timeout(deadline.saturating_duration_since(Instant::now())),
        };
        ticket.wait_done(remaining)?;
    }
    Ok(())
}

impl Journal for FileJournal {
    fn prepare(&self) -> CrystalResult<RecoveryScan> {
        self.config
            .validate()
            .map_err(|e| CrystalError::invalid_argument(e.to_string()))?;
        if self.state.lock().open {
            return Err(CrystalError::invalid_argument("journal already prepared"));
        }
        self.filer.prepare_and_check()?;

        let mut found: Vec<(u64, PathBuf)> = self
            .filer
            .list_files(BOOK_PATTERN)?
            .into_iter()
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?;
                parse_book_file_name(name).map(|seq| (seq, path.clone()))
            })
            .collect();
        found.sort_by_key(|(seq, _)| *seq);
        let newest = found.last().map(|(seq, _)| *seq);

        let mut scan = RecoveryScan::empty();
        let mut books = VecDeque::new();
        let mut store_uuid: Option<[u8; 16]> = None;

        for (sequence, path) in found {
            let bytes = self.filer.read_wait(&path, 0, TO_END, Wait::Infinite)?;
            let is_newest = Some(sequence) == newest;
            let mut book_scan = scan_book(sequence, &bytes, &self.pool);
            let mut trusted = true;

            if let Some(header) = &book_scan.header {
                let foreign = match store_uuid {
                    None => {
                        store_uuid = Some(header.store_uuid);
                        false
                    }
                    Some(uuid) => uuid != header.store_uuid,
                };
                if foreign || header.sequence != sequence {
                    warn!(book = sequence, "Journal book belongs to another store or sequence");
                    book_scan.records.clear();
                    trusted = false;
                }
            }

            let size = match &book_scan.stop {
                ScanStop::EndOfData => book_scan.valid_len,
                ScanStop::TornTail { .. } | ScanStop::Corrupt { .. } => {
                    warn!(
                        book = sequence,
                        stop = ?book_scan.stop,
                        valid_len = book_scan.valid_len,
                        "Journal book tail does not decode"
                    );
                    if !is_newest {
                        trusted = false;
                    }
                    scan.repairs.push(BookRepair::Truncate {
                        path: path.clone(),
                        len: book_scan.valid_len,
                    });
                    book_scan.valid_len
                }
                ScanStop::BadHeader(detail) => {
                    if is_newest && bytes.len() < BOOK_HEADER_SIZE {
                        // Created but never written before the crash.
                        debug!(book = sequence, "Journal book is empty");
                        scan.repairs.push(BookRepair::Remove { path });
                        continue;
                    }
                    warn!(book = sequence, detail = %detail, "Journal book header invalid");
                    trusted = false;
                    bytes.len() as u64
                }
            };

            if !trusted {
                scan.inconsistent.push(path.clone());
            }
            scan.books.push(ScannedBook {
                sequence,
                path: path.clone(),
                valid_len: size,
                stop: book_scan.stop.clone(),
            });
            scan.records.append(&mut book_scan.records);
            books.push_back(Book::recovered(sequence, path, size));
        }

        let mut state = self.state.lock();
        state.store_uuid = store_uuid.unwrap_or_else(|| *Uuid::new_v4().as_bytes());
        // Past every book found, including an empty one awaiting removal
        state.next_sequence = newest.map_or(1, |seq| seq + 1);
        state.next_checkpoint = scan.max_checkpoint() + 1;
        state.books = books;
        state.resident = 0;
        state.failure = None;
        state.open = true;

        info!(
            books = scan.books.len(),
            records = scan.records.len(),
            inconsistent = scan.inconsistent.len(),
            "Journal prepared"
        );
        Ok(scan)
    }

    fn repair(&self, scan: &RecoveryScan) -> CrystalResult<()> {
        if !self.state.lock().open {
            return Err(CrystalError::NotStarted);
        }
        for repair in &scan.repairs {
            match repair {
                BookRepair::Truncate { path, len } => {
                    let prefix = self
                        .filer
                        .read_wait(path, 0, *len as usize, Wait::Infinite)?;
                    self.rewrite_prefix(path, &prefix)?;
                    info!(path = %path.display(), len, "Truncated journal book");
                }
                BookRepair::Remove { path } => {
                    self.filer.delete_wait(path, Wait::Infinite)?;
                    debug!(path = %path.display(), "Removed empty journal book");
                }
            }
        }
        Ok(())
    }

    fn get_writer(&self, record_type: u8) -> JournalWriter {
        JournalWriter::new(record_type, &self.pool)
    }

    fn add_record(&self, writer: JournalWriter) -> CrystalResult<Waypoint> {
        if writer.len() > MAX_RECORD_PAYLOAD {
            warn!(
                size = writer.len(),
                record_type = writer.record_type(),
                "Rejected oversize journal record"
            );
            return Err(CrystalError::OverSizeLimit {
                size: writer.len(),
                limit: MAX_RECORD_PAYLOAD,
            });
        }
        if is_reserved_type(writer.record_type()) {
            return Err(CrystalError::invalid_argument(format!(
                "record type {:#04x} is reserved",
                writer.record_type()
            )));
        }
        let mut state = self.open_state()?;
        self.append_locked(&mut state, writer.record_type(), writer.payload())
    }

    fn begin_checkpoint(&self) -> CrystalResult<CheckpointMark> {
        let mut state = self.open_state()?;
        let number = state.next_checkpoint;
        state.next_checkpoint += 1;
        let waypoint = self.append_locked(&mut state, CHECKPOINT_BEGIN, &encode_marker(number))?;
        debug!(checkpoint = number, at = %waypoint, "Checkpoint begun");
        Ok(CheckpointMark { number, waypoint })
    }

    fn complete_checkpoint(&self, mark: CheckpointMark, wait: Wait) -> CrystalResult<()> {
        {
            let mut state = self.open_state()?;
            self.append_locked(&mut state, CHECKPOINT_END, &encode_marker(mark.number))?;
        }
        self.flush(wait)?;

        let removals: Vec<FilerTicket> = {
            let mut state = self.open_state()?;
            let mut removals = Vec::new();
            for book in state.books.iter_mut() {
                if book.sequence < mark.waypoint.book && book.state == BookState::Flushed {
                    book.state = BookState::Recyclable;
                    let ticket = self.filer.delete(book.path.clone());
                    removals.push(ticket.clone());
                    book.removal = Some(ticket);
                }
            }
            removals
        };
        wait_all(&removals, wait)?;

        self.state.lock().reap();
        info!(
            checkpoint = mark.number,
            recycled = removals.len(),
            "Checkpoint complete"
        );
        Ok(())
    }

    fn flush(&self, wait: Wait) -> CrystalResult<()> {
        let tickets = {
            let mut state = self.open_state()?;
            state.submit_all(&self.filer);
            state.in_flight_tickets()
        };
        wait_all(&tickets, wait)?;

        let mut state = self.state.lock();
        state.reap();
        match &state.failure {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn close(&self) -> CrystalResult<()> {
        {
            let mut state = self.state.lock();
            if !state.open {
                return Ok(());
            }
            if let Some(active) = state.books.back_mut() {
                if active.state == BookState::Active {
                    active.state = BookState::Sealed;
                }
            }
        }
        let result = self.flush(Wait::Infinite);
        self.filer.shutdown();
        let mut state = self.state.lock();
        state.open = false;
        state.books.clear();
        state.resident = 0;
        info!("Journal closed");
        result
    }

    fn abort(&self) {
        self.filer.abort();
        let mut state = self.state.lock();
        state.open = false;
        state.books.clear();
        state.resident = 0;
        warn!("Journal aborted, unwritten records dropped");
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn resident_bytes(&self) -> u64 {
        let mut state = self.state.lock();
        state.reap();
        state.resident
    }

    fn book_states(&self) -> Vec<(u64, BookState)> {
        let mut state = self.state.lock();
        state.reap();
        state.books.iter().map(|b| (b.sequence, b.state)).collect()
    }
}

impl Drop for FileJournal {
    fn drop(&mut self) {
        if self.state.get_mut().open {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn open_journal(dir: &Path) -> FileJournal {
        FileJournal::new(
            dir,
            &FilerConfig::for_testing(),
            JournalConfig::for_testing(),
            BufferPool::new(8),
        )
    }

    fn add(journal: &FileJournal, record_type: u8, payload: &[u8]) -> Waypoint {
        let mut writer = journal.get_writer(record_type);
        writer.write_all(payload).unwrap();
        journal.add_record(writer).unwrap()
    }

    #[test]
    fn test_not_started_before_prepare() {
        let dir = tempdir().unwrap();
        let journal = open_journal(dir.path());
        let writer = journal.get_writer(1);
        assert_eq!(journal.add_record(writer), Err(CrystalError::NotStarted));
    }

    #[test]
    fn test_first_record_allocates_book() {
        let dir = tempdir().unwrap();
        let journal = open_journal(dir.path());
        let scan = journal.prepare().unwrap();
        assert!(scan.is_empty());
        assert!(journal.book_states().is_empty());

        let wp = add(&journal, 1, b"hello");
        assert_eq!(wp, Waypoint { book: 1, offset: 32 });
        assert_eq!(journal.book_states(), vec![(1, BookState::Active)]);

        journal.flush(Wait::Infinite).unwrap();
        let len = std::fs::metadata(dir.path().join("book-000001.book"))
            .unwrap()
            .len();
        assert_eq!(len, (BOOK_HEADER_SIZE + FRAME_OVERHEAD + 5) as u64);
    }

    #[test]
    fn test_oversize_rejected_and_book_unchanged() {
        let dir = tempdir().unwrap();
        let journal = open_journal(dir.path());
        journal.prepare().unwrap();
        add(&journal, 1, b"seed");
        journal.flush(Wait::Infinite).unwrap();
        let path = dir.path().join("book-000001.book");
        let before = std::fs::read(&path).unwrap();

        let mut writer = journal.get_writer(1);
        writer.write_all(&vec![0u8; MAX_RECORD_PAYLOAD + 1]).unwrap();
        assert_eq!(
            journal.add_record(writer),
            Err(CrystalError::OverSizeLimit {
                size: MAX_RECORD_PAYLOAD + 1,
                limit: MAX_RECORD_PAYLOAD
            })
        );

        journal.flush(Wait::Infinite).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_reserved_type_rejected() {
        let dir = tempdir().unwrap();
        let journal = open_journal(dir.path());
        journal.prepare().unwrap();
        let writer = journal.get_writer(CHECKPOINT_BEGIN);
        assert!(matches!(
            journal.add_record(writer),
            Err(CrystalError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rotation_seals_and_flushes() {
        let dir = tempdir().unwrap();
        let journal = open_journal(dir.path());
        journal.prepare().unwrap();

        let payload = vec![7u8; 10 * 1024];
        for _ in 0..10 {
            add(&journal, 1, &payload);
        }
        journal.flush(Wait::Infinite).unwrap();

        let states = journal.book_states();
        assert!(states.len() >= 2);
        let (last, rest) = states.split_last().unwrap();
        assert_eq!(last.1, BookState::Active);
        assert!(rest.iter().all(|(_, s)| *s == BookState::Flushed));
        for (seq, _) in &states {
            let size = std::fs::metadata(dir.path().join(book_file_name(*seq)))
                .unwrap()
                .len();
            assert!(size <= JournalConfig::for_testing().book_size);
        }
    }

    #[test]
    fn test_resident_bytes_bounded() {
        let dir = tempdir().unwrap();
        let journal = open_journal(dir.path());
        journal.prepare().unwrap();

        let payload = vec![1u8; MAX_RECORD_PAYLOAD];
        for _ in 0..64 {
            add(&journal, 1, &payload);
            assert!(journal.resident_bytes() <= JournalConfig::for_testing().max_resident_bytes);
        }
        journal.flush(Wait::Infinite).unwrap();
        assert_eq!(journal.resident_bytes(), 0);
    }

    #[test]
    fn test_reopen_scans_records_and_starts_new_book() {
        let dir = tempdir().unwrap();
        {
            let journal = open_journal(dir.path());
            journal.prepare().unwrap();
            add(&journal, 1, b"one");
            add(&journal, 2, b"two");
            journal.close().unwrap();
        }

        let journal = open_journal(dir.path());
        let scan = journal.prepare().unwrap();
        let payloads: Vec<&[u8]> = scan.replay_records().map(|r| &r.payload[..]).collect();
        let expected: Vec<&[u8]> = vec![b"one", b"two"];
        assert_eq!(payloads, expected);
        assert!(scan.inconsistent.is_empty());

        let wp = add(&journal, 1, b"three");
        assert_eq!(wp.book, 2);
    }

    #[test]
    fn test_torn_tail_truncated() {
        let dir = tempdir().unwrap();
        {
            let journal = open_journal(dir.path());
            journal.prepare().unwrap();
            add(&journal, 1, b"whole");
            add(&journal, 1, b"torn record");
            journal.close().unwrap();
        }
        let path = dir.path().join("book-000001.book");
        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 3]).unwrap();

        let journal = open_journal(dir.path());
        let scan = journal.prepare().unwrap();
        assert_eq!(scan.records.len(), 1);
        assert!(scan.inconsistent.is_empty());
        assert!(matches!(scan.books[0].stop, ScanStop::TornTail { .. }));
        assert_eq!(std::fs::read(&path).unwrap().len(), full.len() - 3);

        journal.repair(&scan).unwrap();
        journal.close().unwrap();

        let kept = std::fs::read(&path).unwrap();
        assert_eq!(kept.len(), BOOK_HEADER_SIZE + FRAME_OVERHEAD + 5);
    }

    #[test]
    fn test_empty_newest_book_removed_on_repair() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(book_file_name(1));
        std::fs::write(&path, b"CB").unwrap();

        let journal = open_journal(dir.path());
        let scan = journal.prepare().unwrap();
        assert!(scan.books.is_empty());
        assert_eq!(
            scan.repairs,
            vec![BookRepair::Remove {
                path: PathBuf::from(book_file_name(1))
            }]
        );
        assert!(path.exists());

        journal.repair(&scan).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_corrupt_older_book_reported() {
        let dir = tempdir().unwrap();
        {
            let journal = open_journal(dir.path());
            journal.prepare().unwrap();
            add(&journal, 1, b"a");
            journal.close().unwrap();
        }
        {
            let journal = open_journal(dir.path());
            journal.prepare().unwrap();
            add(&journal, 1, b"b");
            journal.close().unwrap();
        }
        let path = dir.path().join("book-000001.book");
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let journal = open_journal(dir.path());
        let scan = journal.prepare().unwrap();
        assert_eq!(scan.inconsistent, vec![PathBuf::from("book-000001.book")]);
        assert_eq!(scan.records.len(), 1);
        assert_eq!(&scan.records[0].payload[..], b"b");
    }

    #[test]
    fn test_checkpoint_recycles_older_books() {
        let dir = tempdir().unwrap();
        {
            let journal = open_journal(dir.path());
            journal.prepare().unwrap();
            add(&journal, 1, b"old");
            journal.close().unwrap();
        }

        let journal = open_journal(dir.path());
        let scan = journal.prepare().unwrap();
        assert_eq!(scan.records.len(), 1);
        add(&journal, 1, b"new");

        let mark = journal.begin_checkpoint().unwrap();
        add(&journal, 1, b"during");
        journal.complete_checkpoint(mark, Wait::Infinite).unwrap();

        let states = journal.book_states();
        assert!(states.iter().all(|(seq, _)| *seq >= 2));
        journal.close().unwrap();
        assert!(!dir.path().join("book-000001.book").exists());

        let journal = open_journal(dir.path());
        let scan = journal.prepare().unwrap();
        assert_eq!(scan.last_completed_checkpoint().map(|(n, _)| n), Some(1));
        let replayed: Vec<&[u8]> = scan.replay_records().map(|r| &r.payload[..]).collect();
        let expected: Vec<&[u8]> = vec![b"during"];
        assert_eq!(replayed, expected);

        // Numbering continues after the highest marker on disk
        let mark = journal.begin_checkpoint().unwrap();
        assert_eq!(mark.number, 2);
    }
}
