//! Coalescing background task.
//!
//! A [`ScheduledTask`] owns one worker thread and one callback. Any number of
//! callers may ask it to run; requests collapse into at most one pending and
//! one in-flight execution, the callback never overlaps with itself, and a
//! request made while the callback runs is never lost.
//!
//! # State machine
//!
//! ```text
//!            start_now                         worker claims
//!   Idle ───────────────▶ PendingImmediate ───────────────┐
//!    │ ▲  start_after_delay                                 ▼
//!    │ └───────────────── ResettingTimer ◀────────────── Running ◀─┐
//!    ▼                                          start_now │        │ rerun
//!   PendingDelayed ──────────────────────────────────────┤        │
//!    (timer fires: worker claims)       RunAgainRequested ─────────┘
//!                                                 ▲
//!         start_after_delay while Running:        │ start_now
//!   Running ▶ RunAgainPendingDelayTransition ▶ RunAgainDelayed
//!                                                 │ after run
//!                                                 ▼
//!                                           PendingDelayed
//! ```
//!
//! Every transition is a compare-and-swap on one `AtomicU8`; callers retry
//! under a [`Backoff`] that spins briefly and then yields.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::threading::worker::{WorkerControl, WorkerThread};

/// Scheduler state, stored as a single atomic byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Nothing scheduled or running.
    Idle = 0,
    /// Worker woken for an immediate run.
    PendingImmediate = 1,
    /// Timer armed for a delayed run.
    PendingDelayed = 2,
    /// Callback executing.
    Running = 3,
    /// Worker is clearing its timer on the way back to `Idle`.
    ResettingTimer = 4,
    /// Callback executing; run again as soon as it returns.
    RunAgainRequested = 5,
    /// Callback executing; a delayed rerun is being recorded.
    RunAgainPendingDelayTransition = 6,
    /// Callback executing; arm the timer for a rerun once it returns.
    RunAgainDelayed = 7,
    /// No further executions will start.
    Disposed = 8,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::PendingImmediate,
            2 => Self::PendingDelayed,
            3 => Self::Running,
            4 => Self::ResettingTimer,
            5 => Self::RunAgainRequested,
            6 => Self::RunAgainPendingDelayTransition,
            7 => Self::RunAgainDelayed,
            _ => Self::Disposed,
        }
    }
}

struct StateCell(AtomicU8);

impl StateCell {
    fn load(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn try_change(&self, from: TaskState, to: TaskState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn set(&self, to: TaskState) {
        self.0.store(to as u8, Ordering::SeqCst);
    }
}

/// Why the callback is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskRunArgs {
    /// The run was started by an expired delay.
    pub was_delayed: bool,
    /// Final invocation made by [`ScheduledTask::dispose`].
    pub is_dispose: bool,
    /// The run follows another run without the task going idle.
    pub is_rerun: bool,
}

/// Callback bound to a [`ScheduledTask`].
pub type TaskCallback = Box<dyn FnMut(TaskRunArgs) + Send>;

enum NextAction {
    RunAgain,
    Quit,
}

#[derive(Default)]
struct QuitSignal {
    quit: Mutex<bool>,
    condvar: Condvar,
}

impl QuitSignal {
    fn set(&self) {
        let mut quit = self.quit.lock();
        *quit = true;
        self.condvar.notify_all();
    }

    fn wait(&self) {
        let mut quit = self.quit.lock();
        while !*quit {
            self.condvar.wait(&mut quit);
        }
    }
}

struct TaskInner {
    name: String,
    state: StateCell,
    disposing: AtomicBool,
    delay_requested_nanos: AtomicU64,
    callback: Mutex<Option<TaskCallback>>,
    has_quit: QuitSignal,
}

impl TaskInner {
    fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::SeqCst)
    }

    fn begin_run(&self, worker: &WorkerControl) {
        let was_delayed = self.state.try_change(TaskState::PendingDelayed, TaskState::Running);
        if !was_delayed && !self.state.try_change(TaskState::PendingImmediate, TaskState::Running) {
            // Woken by a request that an earlier run already absorbed.
            return;
        }

        let mut args = TaskRunArgs {
            was_delayed,
            ..TaskRunArgs::default()
        };
        loop {
            if self.is_disposing() {
                self.quit(worker);
                return;
            }
            self.invoke(args);
            match self.after_execute(worker) {
                NextAction::Quit => return,
                NextAction::RunAgain => {
                    args = TaskRunArgs {
                        is_rerun: true,
                        ..TaskRunArgs::default()
                    };
                }
            }
        }
    }

    fn after_execute(&self, worker: &WorkerControl) -> NextAction {
        let backoff = Backoff::new();
        loop {
            if self.is_disposing() {
                self.quit(worker);
                return NextAction::Quit;
            }
            match self.state.load() {
                TaskState::Running => {
                    if self.state.try_change(TaskState::Running, TaskState::ResettingTimer) {
                        worker.reset_timer();
                        self.state.set(TaskState::Idle);
                        return NextAction::Quit;
                    }
                }
                TaskState::RunAgainRequested => {
                    if self.state.try_change(TaskState::RunAgainRequested, TaskState::Running) {
                        return NextAction::RunAgain;
                    }
                }
                TaskState::RunAgainPendingDelayTransition => {}
                TaskState::RunAgainDelayed => {
                    if self.state.try_change(TaskState::RunAgainDelayed, TaskState::PendingDelayed) {
                        worker.start_later(self.delay_requested());
                        return NextAction::Quit;
                    }
                }
                TaskState::Disposed => {}
                state @ (TaskState::Idle
                | TaskState::PendingImmediate
                | TaskState::PendingDelayed
                | TaskState::ResettingTimer) => {
                    error!(task = %self.name, ?state, "Scheduled task left Running unexpectedly, stopping worker");
                    self.quit(worker);
                    return NextAction::Quit;
                }
            }
            backoff.snooze();
        }
    }

    fn invoke(&self, args: TaskRunArgs) {
        let mut callback = self.callback.lock();
        let Some(callback) = callback.as_mut() else {
            return;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| callback(args))).is_err() {
            error!(task = %self.name, ?args, "Scheduled task callback panicked");
        }
    }

    fn quit(&self, worker: &WorkerControl) {
        worker.dispose();
        self.has_quit.set();
    }

    fn delay_requested(&self) -> Duration {
        Duration::from_nanos(self.delay_requested_nanos.load(Ordering::SeqCst))
    }
}

/// Coalescing, non-overlapping background execution of one callback.
pub struct ScheduledTask {
    inner: Arc<TaskInner>,
    worker: WorkerThread,
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl ScheduledTask {
    /// Creates a task bound to `callback` with its own worker thread.
    ///
    /// # Errors
    ///
    /// Returns `DenError::Io` if the worker thread cannot be spawned.
    pub fn new<F>(name: &str, callback: F) -> Result<Self>
    where
        F: FnMut(TaskRunArgs) + Send + 'static,
    {
        let inner = Arc::new(TaskInner {
            name: name.to_string(),
            state: StateCell(AtomicU8::new(TaskState::Idle as u8)),
            disposing: AtomicBool::new(false),
            delay_requested_nanos: AtomicU64::new(0),
            callback: Mutex::new(Some(Box::new(callback))),
            has_quit: QuitSignal::default(),
        });
        let worker_inner = inner.clone();
        let worker = WorkerThread::spawn(name, move |control| worker_inner.begin_run(control))?;
        Ok(Self { inner, worker })
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        self.inner.state.load()
    }

    /// Returns true once [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposing()
    }

    /// Runs the callback as soon as possible.
    ///
    /// A pending delay is cut short. If the callback is running, one more run
    /// follows it.
    pub fn start_now(&self) {
        self.start_immediately(true);
    }

    /// Like [`start_now`](Self::start_now), but never requests a rerun of an
    /// execution that is already running.
    pub fn start_if_idle(&self) {
        self.start_immediately(false);
    }

    /// Runs the callback after `delay` unless a run is already scheduled.
    ///
    /// Called while the callback runs, the delay starts once it returns.
    /// This never pushes back an armed timer.
    pub fn start_after_delay(&self, delay: Duration) {
        let inner = &*self.inner;
        let control = self.worker.control();
        let backoff = Backoff::new();
        loop {
            if inner.is_disposing() {
                return;
            }
            match inner.state.load() {
                TaskState::Idle => {
                    if inner.state.try_change(TaskState::Idle, TaskState::PendingDelayed) {
                        control.start_later(delay);
                        return;
                    }
                }
                TaskState::Running => {
                    if inner
                        .state
                        .try_change(TaskState::Running, TaskState::RunAgainPendingDelayTransition)
                    {
                        control.reset_timer();
                        let nanos = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
                        inner.delay_requested_nanos.store(nanos, Ordering::SeqCst);
                        inner.state.set(TaskState::RunAgainDelayed);
                        return;
                    }
                }
                TaskState::ResettingTimer => {}
                TaskState::PendingDelayed
                | TaskState::PendingImmediate
                | TaskState::RunAgainRequested
                | TaskState::RunAgainPendingDelayTransition
                | TaskState::RunAgainDelayed
                | TaskState::Disposed => return,
            }
            backoff.snooze();
        }
    }

    /// Stops all future runs.
    ///
    /// With `wait_for_exit`, blocks until the worker has quit and then invokes
    /// the callback one last time with [`TaskRunArgs::is_dispose`] set. A
    /// second call does nothing.
    pub fn dispose(&self, wait_for_exit: bool) {
        let inner = &*self.inner;
        if inner.disposing.swap(true, Ordering::SeqCst) {
            return;
        }
        let wait_for_exit = if wait_for_exit && self.worker.is_current() {
            warn!(task = %inner.name, "Dispose requested from the task's own callback, not waiting");
            false
        } else {
            wait_for_exit
        };

        let control = self.worker.control();
        let backoff = Backoff::new();
        loop {
            match inner.state.load() {
                TaskState::Idle => {
                    if inner.state.try_change(TaskState::Idle, TaskState::Disposed) {
                        control.dispose();
                        break;
                    }
                }
                TaskState::PendingDelayed => {
                    if inner
                        .state
                        .try_change(TaskState::PendingDelayed, TaskState::PendingImmediate)
                    {
                        control.short_circuit();
                        if wait_for_exit {
                            inner.has_quit.wait();
                        }
                        break;
                    }
                }
                TaskState::PendingImmediate | TaskState::Running | TaskState::RunAgainRequested => {
                    if wait_for_exit {
                        inner.has_quit.wait();
                    }
                    break;
                }
                TaskState::RunAgainDelayed => {
                    inner
                        .state
                        .try_change(TaskState::RunAgainDelayed, TaskState::RunAgainRequested);
                }
                TaskState::RunAgainPendingDelayTransition | TaskState::ResettingTimer => {}
                TaskState::Disposed => break,
            }
            backoff.snooze();
        }

        if wait_for_exit {
            self.worker.join();
            let args = TaskRunArgs {
                is_dispose: true,
                ..TaskRunArgs::default()
            };
            inner.invoke(args);
            inner.callback.lock().take();
            debug!(task = %inner.name, "Scheduled task disposed");
        }
    }

    fn start_immediately(&self, rerun_if_running: bool) {
        let inner = &*self.inner;
        let control = self.worker.control();
        let backoff = Backoff::new();
        loop {
            if inner.is_disposing() {
                return;
            }
            match inner.state.load() {
                TaskState::Idle => {
                    if inner.state.try_change(TaskState::Idle, TaskState::PendingImmediate) {
                        control.start_now();
                        return;
                    }
                }
                TaskState::PendingDelayed => {
                    if inner
                        .state
                        .try_change(TaskState::PendingDelayed, TaskState::PendingImmediate)
                    {
                        control.short_circuit();
                        return;
                    }
                }
                TaskState::Running if rerun_if_running => {
                    if inner.state.try_change(TaskState::Running, TaskState::RunAgainRequested) {
                        return;
                    }
                }
                TaskState::RunAgainDelayed => {
                    if inner
                        .state
                        .try_change(TaskState::RunAgainDelayed, TaskState::RunAgainRequested)
                    {
                        return;
                    }
                }
                TaskState::ResettingTimer | TaskState::RunAgainPendingDelayTransition => {}
                TaskState::Running
                | TaskState::RunAgainRequested
                | TaskState::PendingImmediate
                | TaskState::Disposed => return,
            }
            backoff.snooze();
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.dispose(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Instant;

    type Calls = Arc<Mutex<Vec<TaskRunArgs>>>;

    fn recording_task(run_time: Duration) -> (ScheduledTask, Calls) {
        let calls: Calls = Arc::default();
        let sink = calls.clone();
        let task = ScheduledTask::new("test-task", move |args| {
            sink.lock().push(args);
            if !args.is_dispose {
                thread::sleep(run_time);
            }
        })
        .unwrap();
        (task, calls)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_start_now_runs_and_returns_to_idle() {
        let (task, calls) = recording_task(Duration::ZERO);
        task.start_now();
        wait_until(|| calls.lock().len() == 1 && task.state() == TaskState::Idle);
        assert_eq!(calls.lock()[0], TaskRunArgs::default());
        assert_eq!(task.state(), TaskState::Idle);
    }

    #[test]
    fn test_start_while_running_reruns_once() {
        let (task, calls) = recording_task(Duration::from_millis(50));
        task.start_now();
        wait_until(|| !calls.lock().is_empty());
        for _ in 0..5 {
            task.start_now();
        }
        wait_until(|| calls.lock().len() == 2 && task.state() == TaskState::Idle);
        thread::sleep(Duration::from_millis(80));

        let calls = calls.lock();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].is_rerun);
    }

    #[test]
    fn test_start_if_idle_does_not_rerun() {
        let (task, calls) = recording_task(Duration::from_millis(50));
        task.start_now();
        wait_until(|| !calls.lock().is_empty());
        task.start_if_idle();
        assert_eq!(task.state(), TaskState::Running);
        wait_until(|| task.state() == TaskState::Idle);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(calls.lock().len(), 1);
    }

    #[test]
    fn test_delayed_run_and_short_circuit() {
        let (task, calls) = recording_task(Duration::ZERO);
        task.start_after_delay(Duration::from_millis(30));
        assert_eq!(task.state(), TaskState::PendingDelayed);
        wait_until(|| calls.lock().len() == 1);
        assert!(calls.lock()[0].was_delayed);

        wait_until(|| task.state() == TaskState::Idle);
        let started = Instant::now();
        task.start_after_delay(Duration::from_secs(60));
        task.start_now();
        wait_until(|| calls.lock().len() == 2);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!calls.lock()[1].was_delayed);
    }

    #[test]
    fn test_unbounded_delay_stays_pending() {
        let (task, calls) = recording_task(Duration::ZERO);
        task.start_after_delay(Duration::MAX);
        assert_eq!(task.state(), TaskState::PendingDelayed);
        thread::sleep(Duration::from_millis(20));
        assert!(calls.lock().is_empty());

        task.start_now();
        wait_until(|| calls.lock().len() == 1);
        assert!(!calls.lock()[0].was_delayed);
        wait_until(|| task.state() == TaskState::Idle);
    }

    #[test]
    fn test_delay_requested_while_running() {
        let (task, calls) = recording_task(Duration::from_millis(40));
        task.start_now();
        wait_until(|| !calls.lock().is_empty());
        task.start_after_delay(Duration::from_millis(10));
        assert_eq!(task.state(), TaskState::RunAgainDelayed);

        wait_until(|| calls.lock().len() == 2);
        let calls = calls.lock();
        assert!(calls[1].was_delayed);
        assert!(!calls[1].is_rerun);
    }

    #[test]
    fn test_concurrent_starts_never_overlap() {
        let active = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));
        let runs = Arc::new(AtomicUsize::new(0));
        let task = {
            let (active, overlapped, runs) = (active.clone(), overlapped.clone(), runs.clone());
            Arc::new(
                ScheduledTask::new("overlap", move |args| {
                    if args.is_dispose {
                        return;
                    }
                    if active.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlapped.store(true, Ordering::SeqCst);
                    }
                    runs.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(2));
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap(),
            )
        };

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let task = task.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        task.start_now();
                        thread::yield_now();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        wait_until(|| task.state() == TaskState::Idle);

        assert!(!overlapped.load(Ordering::SeqCst));
        let total = runs.load(Ordering::SeqCst);
        assert!(total >= 1 && total <= 400);
        task.dispose(true);
    }

    #[test]
    fn test_dispose_waits_and_notifies() {
        let (task, calls) = recording_task(Duration::from_millis(30));
        task.start_now();
        wait_until(|| !calls.lock().is_empty());
        task.dispose(true);

        {
            let calls = calls.lock();
            assert_eq!(calls.len(), 2);
            assert!(calls[1].is_dispose);
        }
        assert!(task.is_disposed());

        task.start_now();
        task.start_after_delay(Duration::ZERO);
        task.dispose(true);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(calls.lock().len(), 2);
    }

    #[test]
    fn test_dispose_idle_goes_straight_to_disposed() {
        let (task, calls) = recording_task(Duration::ZERO);
        task.dispose(true);
        assert_eq!(task.state(), TaskState::Disposed);
        assert_eq!(calls.lock().len(), 1);
        assert!(calls.lock()[0].is_dispose);
    }

    #[test]
    fn test_dispose_pending_delay_skips_run() {
        let (task, calls) = recording_task(Duration::ZERO);
        task.start_after_delay(Duration::from_secs(60));
        task.dispose(true);
        let calls = calls.lock();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].is_dispose);
    }

    #[test]
    fn test_panicking_callback_keeps_task_alive() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let task = ScheduledTask::new("panics", move |args| {
            if args.is_dispose {
                return;
            }
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first run fails");
            }
        })
        .unwrap();

        task.start_now();
        wait_until(|| runs.load(Ordering::SeqCst) == 1 && task.state() == TaskState::Idle);
        task.start_now();
        wait_until(|| runs.load(Ordering::SeqCst) == 2);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
