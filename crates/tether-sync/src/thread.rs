//! Cooperative worker threads.
//!
//! A [`CooperativeThread`] owns one OS thread running an event loop over a
//! private [`WaitSet`]. Readiness is dispatched to a user [`Worker`]; all
//! callbacks run on that one thread and never concurrently with each other.
//!
//! ```text
//! Created --start--> Running <--stop/start--> Stopped --drop--> Exited
//! ```
//!
//! The wait set is only touched by the worker itself. Other threads request
//! additions and removals through a queue that the loop drains between
//! waits, and a private auto-reset event (the wake-up handle) interrupts a
//! blocked wait whenever the queue or the running flag changes.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, error, info, info_span, warn};

use crate::config::ThreadConfig;
use crate::event::Event;
use crate::handle::{Handle, Timeout, WaitObject, WaitResult, wait_for_object};
use crate::wait_set::WaitSet;
use crate::{Result, SyncError};

/// Recorded in place of an empty failure description.
const EMPTY_ERROR_TEXT: &str = "worker failed without a description";

/// Error type returned by worker callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type returned by worker callbacks.
pub type WorkerResult = std::result::Result<(), BoxError>;

/// User logic driven by a [`CooperativeThread`].
///
/// Returning an error (or panicking) from any callback ends the worker:
/// the description is captured, the thread moves to
/// [`ThreadState::Exited`], and everyone waiting on it is released.
pub trait Worker: Send + 'static {
    /// Runs once on the worker thread before the first iteration.
    fn setup(&mut self, _control: &ThreadControl) -> WorkerResult {
        Ok(())
    }

    /// A registered handle became ready, or the wait timed out, in which
    /// case `handle` is [`Handle::INVALID`].
    fn iterate(&mut self, control: &ThreadControl, handle: Handle) -> WorkerResult;

    /// A registered handle hung up. The handle stays registered until the
    /// worker removes it.
    fn abandoned(&mut self, _control: &ThreadControl, _handle: Handle) -> WorkerResult {
        Ok(())
    }

    /// The wait failed for `handle`.
    fn error(&mut self, _control: &ThreadControl, _handle: Handle) -> WorkerResult {
        Ok(())
    }
}

/// Lifecycle state of a cooperative thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Spawned, never started.
    Created = 0,
    /// Dispatching.
    Running = 1,
    /// Stopped; may be started again.
    Stopped = 2,
    /// The loop has ended for good.
    Exited = 3,
}

impl ThreadState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Stopped,
            _ => Self::Exited,
        }
    }
}

enum Mutation {
    Add(Arc<dyn WaitObject>),
    Remove(Handle),
}

struct Shared {
    name: String,
    running: AtomicBool,
    exiting: AtomicBool,
    state: AtomicU8,
    /// Held across every change of `running`, `state` and `stopped` that
    /// must appear atomic to observers.
    transition: Mutex<()>,
    /// Auto-reset wake-up handle, registered in the worker's wait set.
    trigger: Arc<Event>,
    /// Manual reset, set whenever the loop is not dispatching.
    stopped: Event,
    /// Manual reset, set once when the loop has ended.
    exited: Event,
    wait_timeout: Mutex<Timeout>,
    pending: Mutex<VecDeque<Mutation>>,
    error: Mutex<String>,
}

impl Shared {
    fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    fn mark_running(&self) {
        let _transition = self.transition.lock();
        if self.is_running() && self.state() != ThreadState::Exited {
            self.set_state(ThreadState::Running);
        }
    }

    fn mark_stopped(&self) -> Result<()> {
        let _transition = self.transition.lock();
        if self.is_running() {
            debug!("Restarted before the stop completed");
            return Ok(());
        }
        if self.state() != ThreadState::Exited {
            self.set_state(ThreadState::Stopped);
        }
        self.stopped.set()?;
        info!("Worker stopped");
        Ok(())
    }

    fn apply_pending(&self, wait_set: &mut WaitSet) -> Result<()> {
        let mut pending = self.pending.lock();
        while let Some(mutation) = pending.pop_front() {
            match mutation {
                Mutation::Add(object) => {
                    wait_set.add(object)?;
                }
                Mutation::Remove(handle) => {
                    wait_set.remove(handle)?;
                }
            }
        }
        Ok(())
    }

    fn record_error(&self, text: String) {
        let text = if text.is_empty() {
            EMPTY_ERROR_TEXT.to_string()
        } else {
            text
        };
        error!("Worker failed: {text}");
        *self.error.lock() = text;
    }
}

/// Cloneable control surface of a cooperative thread.
///
/// Every worker callback receives one, and [`CooperativeThread::control`]
/// hands out more. All methods may be called from any thread.
#[derive(Clone)]
pub struct ThreadControl {
    shared: Arc<Shared>,
}

impl ThreadControl {
    /// Start (or restart) dispatching.
    ///
    /// Fails with [`SyncError::InvalidOperation`] if a previous run left an
    /// error or the thread is being torn down.
    pub fn start(&self) -> Result<()> {
        let _transition = self.shared.transition.lock();
        let error = self.error();
        if !error.is_empty() {
            return Err(SyncError::InvalidOperation(format!(
                "thread exited with error: {error}"
            )));
        }
        if self.shared.is_exiting() {
            return Err(SyncError::InvalidOperation(
                "thread is shutting down and cannot start".to_string(),
            ));
        }

        self.shared.running.store(true, Ordering::Release);
        self.shared.set_state(ThreadState::Running);
        self.shared.stopped.reset()?;
        self.shared.trigger.set()
    }

    /// Ask the loop to stop dispatching.
    ///
    /// Returns immediately; the loop observes the request at its next
    /// wake-up, which the call itself triggers.
    pub fn stop(&self) -> Result<()> {
        self.shared.running.store(false, Ordering::Release);
        self.shared.trigger.set()
    }

    /// Check whether the thread is not (or no longer) dispatching.
    pub fn is_stopping(&self) -> bool {
        !self.shared.is_running()
    }

    /// Queue `object` for registration in the worker's wait set.
    pub fn add_wait_object(&self, object: Arc<dyn WaitObject>) -> Result<()> {
        let handle = object.handle();
        if !handle.is_valid() {
            return Err(SyncError::InvalidHandle(handle));
        }
        self.shared.pending.lock().push_back(Mutation::Add(object));
        debug!("Queued registration of {handle}");
        self.shared.trigger.set()
    }

    /// Queue removal of `handle` from the worker's wait set.
    pub fn remove_wait_object(&self, handle: Handle) -> Result<()> {
        self.shared
            .pending
            .lock()
            .push_back(Mutation::Remove(handle));
        debug!("Queued removal of {handle}");
        self.shared.trigger.set()
    }

    /// Set the base polling interval. Takes effect at the next wait.
    pub fn set_wait_timeout(&self, timeout: Timeout) {
        *self.shared.wait_timeout.lock() = timeout;
    }

    /// Current base polling interval.
    pub fn wait_timeout(&self) -> Timeout {
        *self.shared.wait_timeout.lock()
    }

    /// Last captured failure description; empty when there was none.
    pub fn error(&self) -> String {
        self.shared.error.lock().clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ThreadState {
        self.shared.state()
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Handle of the private wake-up event.
    pub fn wake_handle(&self) -> Handle {
        self.shared.trigger.handle()
    }

    /// Block until the loop is not dispatching.
    pub fn wait_stopped(&self, timeout: Timeout) -> Result<WaitResult> {
        wait_for_object(&self.shared.stopped, timeout)
    }

    /// Block until the loop has ended for good.
    pub fn wait_exited(&self, timeout: Timeout) -> Result<WaitResult> {
        wait_for_object(&self.shared.exited, timeout)
    }
}

impl std::fmt::Debug for ThreadControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadControl")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// A dedicated worker thread looping over a wait set.
///
/// As a [`WaitObject`] the thread is ready whenever it is stopped; starting
/// it resets that. Dropping the thread stops it and blocks until the OS
/// thread has finished, so no callback can run after `drop` returns.
pub struct CooperativeThread {
    control: ThreadControl,
    join: Option<JoinHandle<()>>,
}

impl CooperativeThread {
    /// Spawn the OS thread. The loop waits for [`start`](Self::start).
    pub fn spawn<W: Worker>(config: ThreadConfig, worker: W) -> Result<Self> {
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            running: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            state: AtomicU8::new(ThreadState::Created as u8),
            transition: Mutex::new(()),
            trigger: Arc::new(Event::new(false, false)?),
            stopped: Event::new(true, false)?,
            exited: Event::new(true, false)?,
            wait_timeout: Mutex::new(config.wait_timeout),
            pending: Mutex::new(VecDeque::new()),
            error: Mutex::new(String::new()),
        });
        let control = ThreadControl { shared };

        let parent = tracing::Span::current();
        let thread_control = control.clone();
        let join = std::thread::Builder::new()
            .name(config.name)
            .spawn(move || {
                let span = info_span!(
                    parent: &parent,
                    "cooperative_thread",
                    name = %thread_control.name()
                );
                let _guard = span.enter();
                run(&thread_control, worker);
            })
            .map_err(|source| SyncError::Syscall {
                call: "pthread_create",
                source,
            })?;

        Ok(Self {
            control,
            join: Some(join),
        })
    }

    /// See [`ThreadControl::start`].
    pub fn start(&self) -> Result<()> {
        self.control.start()
    }

    /// See [`ThreadControl::stop`].
    pub fn stop(&self) -> Result<()> {
        self.control.stop()
    }

    /// See [`ThreadControl::is_stopping`].
    pub fn is_stopping(&self) -> bool {
        self.control.is_stopping()
    }

    /// See [`ThreadControl::error`].
    pub fn error(&self) -> String {
        self.control.error()
    }

    /// See [`ThreadControl::state`].
    pub fn state(&self) -> ThreadState {
        self.control.state()
    }

    /// See [`ThreadControl::add_wait_object`].
    pub fn add_wait_object(&self, object: Arc<dyn WaitObject>) -> Result<()> {
        self.control.add_wait_object(object)
    }

    /// See [`ThreadControl::remove_wait_object`].
    pub fn remove_wait_object(&self, handle: Handle) -> Result<()> {
        self.control.remove_wait_object(handle)
    }

    /// See [`ThreadControl::set_wait_timeout`].
    pub fn set_wait_timeout(&self, timeout: Timeout) {
        self.control.set_wait_timeout(timeout);
    }

    /// A control surface that outlives this handle.
    pub fn control(&self) -> ThreadControl {
        self.control.clone()
    }
}

impl WaitObject for CooperativeThread {
    fn handle(&self) -> Handle {
        self.control.shared.stopped.handle()
    }
}

impl std::fmt::Debug for CooperativeThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CooperativeThread")
            .field("control", &self.control)
            .finish_non_exhaustive()
    }
}

impl Drop for CooperativeThread {
    fn drop(&mut self) {
        let shared = &self.control.shared;
        shared.exiting.store(true, Ordering::Release);

        if let Err(e) = self.control.stop() {
            warn!("Failed to signal worker {} during teardown: {e}", shared.name);
        }
        if let Err(e) = wait_for_object(&shared.exited, Timeout::Infinite) {
            warn!("Failed to wait for worker {} to exit: {e}", shared.name);
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run<W: Worker>(control: &ThreadControl, mut worker: W) {
    let shared = &control.shared;

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| event_loop(control, &mut worker)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => shared.record_error(e.to_string()),
        Err(payload) => shared.record_error(panic_text(payload.as_ref())),
    }
    drop(worker);

    let transition = shared.transition.lock();
    shared.running.store(false, Ordering::Release);
    shared.exiting.store(true, Ordering::Release);
    shared.set_state(ThreadState::Exited);
    drop(transition);

    // The events may already be unusable here; nobody is left to report to.
    if let Err(e) = shared.stopped.set() {
        debug!("Ignoring stopped signal failure: {e}");
    }
    if let Err(e) = shared.exited.set() {
        debug!("Ignoring exited signal failure: {e}");
    }
    info!("Worker exited");
}

fn event_loop<W: Worker>(control: &ThreadControl, worker: &mut W) -> WorkerResult {
    let shared = &control.shared;

    let mut wait_set = WaitSet::new()?;
    let trigger: Arc<dyn WaitObject> = shared.trigger.clone();
    let trigger_handle = trigger.handle();
    wait_set.add(trigger)?;

    let mut initialized = false;
    while !shared.is_exiting() {
        wait_for_object(shared.trigger.as_ref(), Timeout::Infinite)?;
        if shared.is_exiting() {
            break;
        }
        if !shared.is_running() {
            // Woken by a queued mutation or a stop that beat the start.
            if shared.state() != ThreadState::Created {
                shared.mark_stopped()?;
            }
            continue;
        }

        if !initialized {
            worker.setup(control)?;
            initialized = true;
        }
        shared.mark_running();

        info!("Worker running");
        loop {
            shared.apply_pending(&mut wait_set)?;

            let timeout = *shared.wait_timeout.lock();
            let wake = wait_set.wait_any(timeout)?;
            match wake.result {
                WaitResult::Success if wake.handle == trigger_handle => {}
                WaitResult::Success => worker.iterate(control, wake.handle)?,
                WaitResult::Timeout => worker.iterate(control, Handle::INVALID)?,
                WaitResult::Abandoned => worker.abandoned(control, wake.handle)?,
                WaitResult::Error if wake.handle == trigger_handle => {
                    return Err("thread wake-up handle failed".into());
                }
                WaitResult::Error => worker.error(control, wake.handle)?,
            }

            if !shared.is_running() {
                break;
            }
        }
        shared.mark_stopped()?;
    }
    Ok(())
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unrecognized panic payload".to_string()
    }
}
