//! Interval-driven background threads.
//!
//! Each [`BackgroundTask`] owns one named thread that runs its tick every
//! interval until the task is stopped. Stopping wakes the thread, lets an
//! in-progress tick finish and joins it.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Wakes sleeping background threads on shutdown
#[derive(Debug, Default)]
pub(crate) struct ShutdownSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl ShutdownSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake every waiter
    pub(crate) fn trigger(&self) {
        let mut stopped = self.stopped.lock();
        *stopped = true;
        self.cond.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn is_triggered(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep up to `timeout`; returns true once shutdown was requested
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.cond.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

/// A named thread running a tick every interval
pub(crate) struct BackgroundTask {
    name: String,
    signal: Arc<ShutdownSignal>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Spawn `name`, calling `tick` after each `interval`
    pub(crate) fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let signal = Arc::new(ShutdownSignal::new());
        let thread_signal = Arc::clone(&signal);
        let thread_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while !thread_signal.wait_timeout(interval) {
                    tick();
                }
                debug!(task = %thread_name, "Background task exiting");
            })?;
        debug!(task = %name, interval_ms = interval.as_millis() as u64, "Background task started");
        Ok(BackgroundTask {
            name: name.to_string(),
            signal,
            handle: Some(handle),
        })
    }

    /// Signal the thread and join it
    pub(crate) fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.signal.trigger();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(task = %self.name, "Background task panicked");
            }
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}
