//! Background worker threads.
//!
//! Each database runs a deferred-action processor and a compactor. Both wait
//! on a [`WorkerSignal`] between units of work, so they can be woken early,
//! suspended while a backup takes its cut, and stopped on shutdown.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use nexus_common::error::{BlobError, BlobResult};

#[derive(Debug, Default)]
struct SignalState {
    stop: bool,
    wake: bool,
    suspended: u32,
    busy: bool,
}

/// Wake, suspend and stop control shared between a worker and its owner.
#[derive(Debug, Default)]
pub struct WorkerSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl WorkerSignal {
    /// Creates a signal in the running state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes the worker before its timeout expires.
    pub fn wake(&self) {
        self.state.lock().wake = true;
        self.cond.notify_all();
    }

    /// Asks the worker to exit.
    pub fn stop(&self) {
        self.state.lock().stop = true;
        self.cond.notify_all();
    }

    /// Returns true once [`stop`](Self::stop) was called.
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stop
    }

    /// Suspends the worker, waiting for its current unit of work to finish.
    /// The worker resumes when the guard is dropped.
    pub fn suspend(&self) -> SuspendGuard<'_> {
        let mut state = self.state.lock();
        state.suspended += 1;
        while state.busy {
            self.cond.wait(&mut state);
        }
        SuspendGuard { signal: self }
    }

    fn resume(&self) {
        let mut state = self.state.lock();
        state.suspended = state.suspended.saturating_sub(1);
        drop(state);
        self.cond.notify_all();
    }

    /// Called by the worker before a unit of work. Blocks while suspended;
    /// returns false if the worker should exit.
    pub(crate) fn begin_work(&self) -> bool {
        let mut state = self.state.lock();
        while state.suspended > 0 && !state.stop {
            self.cond.wait(&mut state);
        }
        if state.stop {
            return false;
        }
        state.busy = true;
        true
    }

    /// Called by the worker after a unit of work.
    pub(crate) fn end_work(&self) {
        self.state.lock().busy = false;
        self.cond.notify_all();
    }

    /// Waits up to `timeout`; returns false if the worker should exit.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.stop && !state.wake {
            self.cond.wait_for(&mut state, timeout);
        }
        state.wake = false;
        !state.stop
    }
}

/// Resumes a suspended worker when dropped.
#[derive(Debug)]
pub struct SuspendGuard<'a> {
    signal: &'a WorkerSignal,
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.signal.resume();
    }
}

/// A running worker thread.
#[derive(Debug)]
pub struct Worker {
    name: String,
    signal: Arc<WorkerSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns a worker running `work` until stopped.
    ///
    /// `work` returns how long to wait before the next unit, or `None` for
    /// `interval`.
    pub fn spawn<F>(
        name: String,
        signal: Arc<WorkerSignal>,
        interval: Duration,
        mut work: F,
    ) -> BlobResult<Self>
    where
        F: FnMut() -> Option<Duration> + Send + 'static,
    {
        let thread_signal = Arc::clone(&signal);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                tracing::debug!(interval_ms = interval.as_millis() as u64, "worker started");
                while thread_signal.begin_work() {
                    let next = work();
                    thread_signal.end_work();
                    if !thread_signal.wait(next.unwrap_or(interval)) {
                        break;
                    }
                }
                tracing::debug!("worker stopped");
            })
            .map_err(|e| BlobError::config(format!("failed to spawn {name}: {e}")))?;

        Ok(Self {
            name,
            signal,
            handle: Some(handle),
        })
    }

    /// The worker's signal.
    pub fn signal(&self) -> &Arc<WorkerSignal> {
        &self.signal
    }

    /// Stops the worker and waits for it to exit.
    pub fn stop(&mut self) {
        self.signal.stop();
        if let Some(handle) = self.handle.take() {
            // The last owner can be the worker itself; it exits on its own.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!(worker = %self.name, "worker thread panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}
