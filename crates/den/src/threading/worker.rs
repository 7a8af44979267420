//! Dedicated worker thread with a one-shot run timer.
//!
//! The worker sleeps until it is asked to run now, a delayed run comes due, or
//! it is disposed. Each wake-up invokes the body once; the body decides
//! whether the wake-up was meaningful.

use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::Result;

/// Deadline used when `now + delay` does not fit in an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[derive(Debug, Default)]
struct WorkerSignal {
    run_now: bool,
    run_at: Option<Instant>,
    disposed: bool,
}

#[derive(Debug, Default)]
struct WorkerShared {
    signal: Mutex<WorkerSignal>,
    condvar: Condvar,
}

/// Cloneable handle used to wake, delay or stop a [`WorkerThread`].
#[derive(Debug, Clone, Default)]
pub struct WorkerControl {
    shared: Arc<WorkerShared>,
}

impl WorkerControl {
    /// Wakes the worker for an immediate run.
    pub fn start_now(&self) {
        let mut signal = self.shared.signal.lock();
        signal.run_now = true;
        self.shared.condvar.notify_one();
    }

    /// Arms the timer to wake the worker after `delay`.
    ///
    /// Delays past the representable range saturate to a far-future deadline.
    pub fn start_later(&self, delay: Duration) {
        let mut signal = self.shared.signal.lock();
        signal.run_at = Some(deadline_after(delay));
        self.shared.condvar.notify_one();
    }

    /// Replaces any pending delayed run with an immediate one.
    pub fn short_circuit(&self) {
        let mut signal = self.shared.signal.lock();
        signal.run_at = None;
        signal.run_now = true;
        self.shared.condvar.notify_one();
    }

    /// Clears any pending run request.
    pub fn reset_timer(&self) {
        let mut signal = self.shared.signal.lock();
        signal.run_now = false;
        signal.run_at = None;
    }

    /// Stops the worker loop after the current run, if any.
    pub fn dispose(&self) {
        let mut signal = self.shared.signal.lock();
        signal.disposed = true;
        self.shared.condvar.notify_all();
    }

    /// Returns true once [`dispose`](Self::dispose) was called.
    pub fn is_disposed(&self) -> bool {
        self.shared.signal.lock().disposed
    }

    /// Blocks until a run is due. Returns false once disposed.
    fn wait_for_run(&self) -> bool {
        let mut signal = self.shared.signal.lock();
        loop {
            if signal.disposed {
                return false;
            }
            if signal.run_now {
                signal.run_now = false;
                signal.run_at = None;
                return true;
            }
            match signal.run_at {
                Some(at) if Instant::now() >= at => {
                    signal.run_at = None;
                    return true;
                }
                Some(at) => {
                    self.shared.condvar.wait_until(&mut signal, at);
                }
                None => self.shared.condvar.wait(&mut signal),
            }
        }
    }
}

/// An OS thread that runs a body each time its [`WorkerControl`] wakes it.
#[derive(Debug)]
pub struct WorkerThread {
    control: WorkerControl,
    thread_id: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerThread {
    /// Spawns a named worker running `body` on every wake-up.
    ///
    /// # Errors
    ///
    /// Returns `DenError::Io` if the thread cannot be spawned.
    pub fn spawn<F>(name: &str, mut body: F) -> Result<Self>
    where
        F: FnMut(&WorkerControl) + Send + 'static,
    {
        let control = WorkerControl::default();
        let worker_control = control.clone();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            while worker_control.wait_for_run() {
                body(&worker_control);
            }
            debug!("Worker thread exiting");
        })?;
        Ok(Self {
            control,
            thread_id: handle.thread().id(),
            join: Mutex::new(Some(handle)),
        })
    }

    /// Control handle for this worker.
    pub fn control(&self) -> &WorkerControl {
        &self.control
    }

    /// Returns true when called from the worker thread itself.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Disposes the worker and waits for the thread to exit.
    ///
    /// Does not wait when called from the worker thread.
    pub fn join(&self) {
        self.control.dispose();
        if self.is_current() {
            return;
        }
        if let Some(handle) = self.join.lock().take() {
            if handle.join().is_err() {
                warn!("Worker thread panicked");
            }
        }
    }
}
