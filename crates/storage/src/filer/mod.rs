//! Queued asynchronous byte-range I/O
//!
//! A [`Filer`] owns one worker thread that drains a FIFO queue of
//! [`FilerJob`]s against a [`FilerBackend`]. Callers either fire and forget
//! (keeping the returned [`FilerTicket`] if they care) or wait with a
//! [`Wait`] policy. A caller timeout never cancels the job.
//!
//! # Coalescing
//!
//! A new job equal to the most recent queued job for the same path shares that
//! job's ticket instead of being queued twice. Only the newest queued job per
//! path is considered, so coalescing never reorders writes to a path.
//!
//! # Lifecycle
//!
//! `prepare_and_check()` must run first; until then every operation resolves
//! to `NotStarted`. `shutdown()` drains the queue and joins the worker;
//! `abort()` drops queued jobs.

mod backend;
mod job;

pub use backend::{matches_pattern, validate_path, FilerBackend, LocalFileBackend, TO_END};
pub use job::{FilerJob, FilerOutcome, FilerTicket, JobKind};

use crystal_core::{BufferPool, CrystalError, CrystalResult, SharedBuffer, Wait};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Cumulative filer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilerCounters {
    /// Jobs accepted into the queue
    pub submitted: u64,
    /// Submissions folded into an identical queued job
    pub coalesced: u64,
    /// Jobs executed successfully
    pub completed: u64,
    /// Jobs whose backend call failed
    pub failed: u64,
}

struct QueuedJob {
    job: FilerJob,
    ticket: FilerTicket,
}

#[derive(Default)]
struct FilerQueue {
    jobs: VecDeque<QueuedJob>,
    in_flight: usize,
}

struct FilerShared {
    backend: Arc<dyn FilerBackend>,
    pool: BufferPool,
    queue: Mutex<FilerQueue>,
    work_ready: Condvar,
    idle: Condvar,
    prepared: AtomicBool,
    shutdown: AtomicBool,
    submitted: AtomicU64,
    coalesced: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Queued, asynchronous front end of a [`FilerBackend`]
pub struct Filer {
    name: String,
    shared: Arc<FilerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Filer {
    /// Create a filer over `backend`; no thread runs until `prepare_and_check`
    pub fn new(name: impl Into<String>, backend: Arc<dyn FilerBackend>, pool: BufferPool) -> Self {
        Filer {
            name: name.into(),
            shared: Arc::new(FilerShared {
                backend,
                pool,
                queue: Mutex::new(FilerQueue::default()),
                work_ready: Condvar::new(),
                idle: Condvar::new(),
                prepared: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                submitted: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Convenience constructor over a local directory
    pub fn local(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        sync_writes: bool,
        pool: BufferPool,
    ) -> Self {
        Self::new(name, Arc::new(LocalFileBackend::new(root, sync_writes)), pool)
    }

    /// Validate/create the backing location and start the worker
    pub fn prepare_and_check(&self) -> CrystalResult<()> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(CrystalError::NotStarted);
        }
        self.shared.backend.prepare()?;

        let mut worker = self.worker.lock();
        if worker.is_none() {
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name(format!("crystal-filer-{}", self.name))
                .spawn(move || worker_loop(&shared))?;
            *worker = Some(handle);
        }
        self.shared.prepared.store(true, Ordering::Release);
        debug!(filer = %self.name, location = %self.shared.backend.location(), "Filer prepared");
        Ok(())
    }

    /// Whether `prepare_and_check` succeeded and the filer is not shut down
    pub fn is_ready(&self) -> bool {
        self.shared.prepared.load(Ordering::Acquire) && !self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Pool used for read buffers
    pub fn pool(&self) -> &BufferPool {
        &self.shared.pool
    }

    /// Queue a write of `data` at `offset`
    pub fn write(&self, path: impl Into<PathBuf>, offset: u64, data: SharedBuffer) -> FilerTicket {
        self.submit(FilerJob::write(path.into(), offset, data))
    }

    /// Write and wait for completion
    pub fn write_wait(
        &self,
        path: impl Into<PathBuf>,
        offset: u64,
        data: SharedBuffer,
        wait: Wait,
    ) -> CrystalResult<()> {
        self.write(path, offset, data).wait_done(wait)
    }

    /// Queue a read of up to `len` bytes at `offset` ([`TO_END`] for the rest)
    pub fn read(&self, path: impl Into<PathBuf>, offset: u64, len: usize) -> FilerTicket {
        self.submit(FilerJob::read(path.into(), offset, len))
    }

    /// Read and wait for the bytes
    pub fn read_wait(
        &self,
        path: impl Into<PathBuf>,
        offset: u64,
        len: usize,
        wait: Wait,
    ) -> CrystalResult<SharedBuffer> {
        self.read(path, offset, len)
            .wait(wait)?
            .ok_or_else(|| CrystalError::deserialize("read completed without a buffer"))
    }

    /// Queue removal of one file
    pub fn delete(&self, path: impl Into<PathBuf>) -> FilerTicket {
        self.submit(FilerJob::delete(path.into()))
    }

    /// Delete and wait for completion
    pub fn delete_wait(&self, path: impl Into<PathBuf>, wait: Wait) -> CrystalResult<()> {
        self.delete(path).wait_done(wait)
    }

    /// Queue removal of everything in the backend
    pub fn delete_all(&self) -> FilerTicket {
        self.submit(FilerJob::delete_all())
    }

    /// Enumerate files matching `pattern` after queued work has drained
    pub fn list_files(&self, pattern: &str) -> CrystalResult<Vec<PathBuf>> {
        if !self.is_ready() {
            return Err(CrystalError::NotStarted);
        }
        self.drain(Wait::Infinite)?;
        self.shared.backend.list(pattern)
    }

    /// Wait until the queue is empty and nothing is executing
    pub fn drain(&self, wait: Wait) -> CrystalResult<()> {
        let mut queue = self.shared.queue.lock();
        let deadline = wait.deadline();
        while !queue.jobs.is_empty() || queue.in_flight > 0 {
            if !self.worker_alive() {
                return Err(CrystalError::NotStarted);
            }
            match deadline {
                None => self.shared.idle.wait(&mut queue),
                Some(at) => {
                    if self.shared.idle.wait_until(&mut queue, at).timed_out() {
                        return Err(CrystalError::Timeout);
                    }
                }
            }
        }
        Ok(())
    }

    /// Number of queued (not yet executing) jobs
    pub fn queue_depth(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    /// Snapshot of cumulative counters
    pub fn counters(&self) -> FilerCounters {
        FilerCounters {
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            coalesced: self.shared.coalesced.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
        }
    }

    /// Drain queued work, stop the worker and join it
    pub fn shutdown(&self) {
        self.stop(false);
    }

    /// Drop queued work (tickets resolve `NotStarted`), stop and join the worker
    pub fn abort(&self) {
        self.stop(true);
    }

    fn stop(&self, discard: bool) {
        {
            // Hold the queue lock while flagging so a worker between its
            // shutdown check and its wait cannot miss the notification.
            let mut queue = self.shared.queue.lock();
            self.shared.shutdown.store(true, Ordering::Release);
            if discard {
                let dropped = queue.jobs.len();
                for queued in queue.jobs.drain(..) {
                    queued.ticket.complete(Err(CrystalError::NotStarted));
                }
                if dropped > 0 {
                    warn!(filer = %self.name, dropped, "Filer aborted with queued jobs");
                }
            }
            self.shared.work_ready.notify_all();
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.shared.idle.notify_all();
    }

    fn worker_alive(&self) -> bool {
        self.worker.lock().is_some()
    }

    fn submit(&self, job: FilerJob) -> FilerTicket {
        if !self.is_ready() {
            return FilerTicket::resolved(Err(CrystalError::NotStarted));
        }
        if job.kind != JobKind::DeleteAll {
            if let Err(e) = validate_path(&job.path) {
                return FilerTicket::resolved(Err(e));
            }
        }

        let mut queue = self.shared.queue.lock();
        if self.shared.shutdown.load(Ordering::Acquire) {
            return FilerTicket::resolved(Err(CrystalError::NotStarted));
        }
        if let Some(existing) = coalesce_target(&queue.jobs, &job) {
            self.shared.coalesced.fetch_add(1, Ordering::Relaxed);
            return existing;
        }

        let ticket = FilerTicket::pending();
        queue.jobs.push_back(QueuedJob {
            job,
            ticket: ticket.clone(),
        });
        self.shared.submitted.fetch_add(1, Ordering::Relaxed);
        self.shared.work_ready.notify_one();
        ticket
    }
}

impl Drop for Filer {
    fn drop(&mut self) {
        if self.worker.lock().is_some() {
            self.shutdown();
        }
    }
}

/// Ticket of the newest queued job for the same path, if it equals `job`
fn coalesce_target(jobs: &VecDeque<QueuedJob>, job: &FilerJob) -> Option<FilerTicket> {
    for queued in jobs.iter().rev() {
        if queued.job.kind == JobKind::DeleteAll {
            return None;
        }
        if queued.job.path == job.path {
            return (queued.job == *job).then(|| queued.ticket.clone());
        }
    }
    None
}

fn execute(shared: &FilerShared, job: &FilerJob) -> FilerOutcome {
    let backend = &shared.backend;
    match job.kind {
        JobKind::Write => {
            let payload = job.payload.as_ref().map(|p| p.as_slice()).unwrap_or(&[]);
            backend.write_at(&job.path, job.offset, payload).map(|_| None)
        }
        JobKind::Read => backend
            .read_at(&job.path, job.offset, job.length, &shared.pool)
            .map(Some),
        JobKind::Delete => backend.delete(&job.path).map(|_| None),
        JobKind::DeleteAll => backend.delete_all().map(|_| None),
    }
}

fn worker_loop(shared: &FilerShared) {
    loop {
        let queued = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(queued) = queue.jobs.pop_front() {
                    queue.in_flight += 1;
                    break queued;
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                shared.work_ready.wait(&mut queue);
            }
        };

        let outcome = execute(shared, &queued.job);
        match &outcome {
            Ok(_) => shared.completed.fetch_add(1, Ordering::Relaxed),
            Err(CrystalError::NoData) => shared.completed.fetch_add(1, Ordering::Relaxed),
            Err(e) => {
                warn!(path = %queued.job.path.display(), kind = ?queued.job.kind, error = %e, "Filer job failed");
                shared.failed.fetch_add(1, Ordering::Relaxed)
            }
        };
        queued.ticket.complete(outcome);

        let mut queue = shared.queue.lock();
        queue.in_flight -= 1;
        if queue.jobs.is_empty() && queue.in_flight == 0 {
            shared.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Backend that blocks every operation until released
    struct GatedBackend {
        inner: LocalFileBackend,
        gate: Arc<(Mutex<bool>, Condvar)>,
    }

    impl GatedBackend {
        fn pass(&self) {
            let (lock, cvar) = &*self.gate;
            let mut open = lock.lock();
            while !*open {
                cvar.wait(&mut open);
            }
        }
    }

    impl FilerBackend for GatedBackend {
        fn prepare(&self) -> CrystalResult<()> {
            self.inner.prepare()
        }
        fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> CrystalResult<()> {
            self.pass();
            self.inner.write_at(path, offset, data)
        }
        fn read_at(
            &self,
            path: &Path,
            offset: u64,
            len: usize,
            pool: &BufferPool,
        ) -> CrystalResult<SharedBuffer> {
            self.pass();
            self.inner.read_at(path, offset, len, pool)
        }
        fn delete(&self, path: &Path) -> CrystalResult<()> {
            self.pass();
            self.inner.delete(path)
        }
        fn delete_all(&self) -> CrystalResult<()> {
            self.pass();
            self.inner.delete_all()
        }
        fn list(&self, pattern: &str) -> CrystalResult<Vec<PathBuf>> {
            self.inner.list(pattern)
        }
        fn location(&self) -> String {
            self.inner.location()
        }
    }

    fn gated(dir: &Path) -> (Filer, Arc<(Mutex<bool>, Condvar)>) {
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let backend = GatedBackend {
            inner: LocalFileBackend::new(dir, false),
            gate: Arc::clone(&gate),
        };
        let filer = Filer::new("gated", Arc::new(backend), BufferPool::new(4));
        filer.prepare_and_check().unwrap();
        (filer, gate)
    }

    fn open_gate(gate: &Arc<(Mutex<bool>, Condvar)>) {
        let (lock, cvar) = &**gate;
        *lock.lock() = true;
        cvar.notify_all();
    }

    fn buf(bytes: &[u8]) -> SharedBuffer {
        SharedBuffer::from_vec(bytes.to_vec())
    }

    #[test]
    fn test_not_started_before_prepare() {
        let dir = tempdir().unwrap();
        let filer = Filer::local("t", dir.path(), false, BufferPool::new(4));
        assert_eq!(
            filer.write_wait("a", 0, buf(b"x"), Wait::Infinite),
            Err(CrystalError::NotStarted)
        );
        assert_eq!(filer.list_files("*"), Err(CrystalError::NotStarted));
    }

    #[test]
    fn test_write_read_delete() {
        let dir = tempdir().unwrap();
        let filer = Filer::local("t", dir.path(), false, BufferPool::new(4));
        filer.prepare_and_check().unwrap();

        filer
            .write_wait("data/one.bin", 0, buf(&[0, 1, 2, 3]), Wait::Infinite)
            .unwrap();
        let read = filer.read_wait("data/one.bin", 1, 2, Wait::Infinite).unwrap();
        assert_eq!(&read[..], &[1, 2]);

        filer.delete_wait("data/one.bin", Wait::Infinite).unwrap();
        assert_eq!(
            filer.read_wait("data/one.bin", 0, TO_END, Wait::Infinite),
            Err(CrystalError::NoData)
        );
        // Deleting again is harmless
        assert!(filer.delete_wait("data/one.bin", Wait::Infinite).is_ok());
    }

    #[test]
    fn test_invalid_path_is_rejected() {
        let dir = tempdir().unwrap();
        let filer = Filer::local("t", dir.path(), false, BufferPool::new(4));
        filer.prepare_and_check().unwrap();
        let result = filer.write_wait("../outside", 0, buf(b"x"), Wait::Infinite);
        assert!(matches!(result, Err(CrystalError::InvalidArgument(_))));
    }

    #[test]
    fn test_timeout_does_not_cancel() {
        let dir = tempdir().unwrap();
        let (filer, gate) = gated(dir.path());

        let ticket = filer.write("slow.bin", 0, buf(b"payload"));
        assert_eq!(
            ticket.wait(Wait::Timeout(Duration::from_millis(20))),
            Err(CrystalError::Timeout)
        );

        open_gate(&gate);
        assert_eq!(ticket.wait(Wait::Infinite), Ok(None));
        assert_eq!(
            &filer.read_wait("slow.bin", 0, TO_END, Wait::Infinite).unwrap()[..],
            b"payload"
        );
    }

    #[test]
    fn test_identical_queued_jobs_coalesce() {
        let dir = tempdir().unwrap();
        let (filer, gate) = gated(dir.path());

        // Occupy the worker so later jobs stay queued
        let blocker = filer.write("blocker", 0, buf(b"b"));
        while filer.queue_depth() > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }

        let first = filer.write("same", 0, buf(b"v1"));
        let second = filer.write("same", 0, buf(b"v1"));
        assert!(first.same_job(&second));

        let different = filer.write("same", 0, buf(b"v2"));
        assert!(!different.same_job(&first));

        // v1 again must not fold into the older v1 behind v2
        let third = filer.write("same", 0, buf(b"v1"));
        assert!(!third.same_job(&first));

        open_gate(&gate);
        blocker.wait_done(Wait::Infinite).unwrap();
        third.wait_done(Wait::Infinite).unwrap();
        assert_eq!(filer.counters().coalesced, 1);
        assert_eq!(
            &filer.read_wait("same", 0, TO_END, Wait::Infinite).unwrap()[..],
            b"v1"
        );
    }

    #[test]
    fn test_abort_discards_queued_jobs() {
        let dir = tempdir().unwrap();
        let (filer, gate) = gated(dir.path());

        let running = filer.write("first", 0, buf(b"1"));
        while filer.queue_depth() > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        let queued = filer.write("second", 0, buf(b"2"));

        let opener = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                open_gate(&gate);
            })
        };
        filer.abort();
        opener.join().unwrap();

        assert_eq!(running.wait(Wait::Infinite), Ok(None));
        assert_eq!(queued.wait(Wait::Infinite), Err(CrystalError::NotStarted));
        assert!(!filer.is_ready());
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let dir = tempdir().unwrap();
        let filer = Filer::local("t", dir.path(), false, BufferPool::new(4));
        filer.prepare_and_check().unwrap();
        let tickets: Vec<_> = (0..20u8)
            .map(|i| filer.write(format!("f{}", i), 0, buf(&[i])))
            .collect();
        filer.shutdown();
        for t in tickets {
            assert!(t.is_complete());
        }
        assert_eq!(filer.counters().completed, 20);
    }

    #[test]
    fn test_list_files_after_writes() {
        let dir = tempdir().unwrap();
        let filer = Filer::local("t", dir.path(), false, BufferPool::new(4));
        filer.prepare_and_check().unwrap();
        filer.write("a.book", 0, buf(b"a"));
        filer.write("b.book", 0, buf(b"b"));
        filer.write("c.tmp", 0, buf(b"c"));
        let listed = filer.list_files("*.book").unwrap();
        assert_eq!(listed, vec![PathBuf::from("a.book"), PathBuf::from("b.book")]);

        filer.delete_all().wait_done(Wait::Infinite).unwrap();
        assert!(filer.list_files("*").unwrap().is_empty());
    }
}
