//! The answering side of an echo run.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tether_channel::{Channel, ChannelError};
use tether_sync::{
    CooperativeThread, Handle, ThreadConfig, ThreadControl, ThreadState, Timeout, WaitObject,
    WaitResult, Worker, WorkerResult,
};
use tracing::{debug, error, info};

use crate::{EchoError, REPLY, REQUEST, Result, WORD, read_word, write_word};

/// Live counters of an echo worker, readable from any thread.
#[derive(Debug, Default)]
pub struct EchoCounters {
    iterations: AtomicU64,
    requests: AtomicU64,
    replies: AtomicU64,
    timeouts: AtomicU64,
}

impl EchoCounters {
    /// Current values.
    pub fn snapshot(&self) -> EchoSummary {
        EchoSummary {
            iterations: self.iterations.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            replies: self.replies.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`EchoCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EchoSummary {
    /// Loop iterations, timeouts included
    pub iterations: u64,
    /// Requests received and released
    pub requests: u64,
    /// Replies sent
    pub replies: u64,
    /// Iterations caused by the poll interval expiring
    pub timeouts: u64,
}

/// Answers every request on its channel with one reply.
///
/// Replies that cannot be allocated yet, or whose notification was
/// deferred, are retried on the next iteration, so a timeout-driven poll
/// keeps a stalled exchange moving.
pub struct EchoWorker {
    channel: Arc<Channel>,
    owed: u32,
    backlogged: bool,
    counters: Arc<EchoCounters>,
}

impl EchoWorker {
    /// Create a worker answering on `channel`.
    pub fn new(channel: Arc<Channel>) -> Self {
        Self {
            channel,
            owed: 0,
            backlogged: false,
            counters: Arc::default(),
        }
    }

    /// Counters shared with this worker.
    pub fn counters(&self) -> Arc<EchoCounters> {
        Arc::clone(&self.counters)
    }

    fn receive_requests(&mut self) -> Result<()> {
        while let Some(message) = self.channel.try_receive()? {
            let word = read_word(&message);
            self.channel.release(&message)?;
            if word != Some(REQUEST) {
                return Err(EchoError::UnexpectedPayload {
                    expected: REQUEST,
                    found: word,
                });
            }
            self.owed += 1;
            self.counters.requests.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn send_replies(&mut self) -> Result<()> {
        if self.backlogged {
            if self.channel.flush()?.is_full() {
                return Ok(());
            }
            self.backlogged = false;
        }

        while self.owed > 0 {
            let mut message = match self.channel.allocate(WORD) {
                Ok(message) => message,
                Err(ChannelError::OutOfSpace { .. }) => {
                    debug!("Reply space exhausted, {} replies pending", self.owed);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            write_word(&mut message, REPLY);
            let status = self.channel.send(message)?;
            self.owed -= 1;
            self.counters.replies.fetch_add(1, Ordering::Relaxed);

            if status.is_full() {
                self.backlogged = true;
                return Ok(());
            }
        }
        Ok(())
    }
}

impl Worker for EchoWorker {
    fn setup(&mut self, control: &ThreadControl) -> WorkerResult {
        info!(
            "Echo thread {} waiting on {}",
            control.name(),
            self.channel.handle()
        );
        control.add_wait_object(self.channel.clone())?;
        Ok(())
    }

    fn iterate(&mut self, _control: &ThreadControl, handle: Handle) -> WorkerResult {
        if handle == self.channel.handle() {
            self.receive_requests()?;
        }
        if handle == Handle::INVALID {
            debug!("Timeout");
            self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
        }

        self.send_replies()?;
        self.counters.iterations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn abandoned(&mut self, _control: &ThreadControl, handle: Handle) -> WorkerResult {
        if handle == self.channel.handle() {
            return Err(EchoError::ChannelAbandoned.into());
        }
        error!("Unrecognized handle {handle} abandoned");
        Ok(())
    }
}

impl Drop for EchoWorker {
    fn drop(&mut self) {
        info!(
            "Echo thread performed {} iterations",
            self.counters.iterations.load(Ordering::Relaxed)
        );
    }
}

/// An [`EchoWorker`] running on its own [`CooperativeThread`].
#[derive(Debug)]
pub struct EchoServer {
    thread: CooperativeThread,
    counters: Arc<EchoCounters>,
}

impl EchoServer {
    /// Spawn the echo thread. It starts answering after [`start`](Self::start).
    pub fn spawn(channel: Arc<Channel>, config: ThreadConfig) -> Result<Self> {
        let worker = EchoWorker::new(channel);
        let counters = worker.counters();
        let thread = CooperativeThread::spawn(config, worker)?;
        Ok(Self { thread, counters })
    }

    /// Start answering.
    pub fn start(&self) -> Result<()> {
        Ok(self.thread.start()?)
    }

    /// Stop answering; the thread stays alive until dropped.
    pub fn stop(&self) -> Result<()> {
        Ok(self.thread.stop()?)
    }

    /// Block until the thread stops on its own or `timeout` passes.
    pub fn wait_stopped(&self, timeout: Timeout) -> Result<WaitResult> {
        Ok(self.thread.control().wait_stopped(timeout)?)
    }

    /// Lifecycle state of the thread.
    pub fn state(&self) -> ThreadState {
        self.thread.state()
    }

    /// Counters so far.
    pub fn summary(&self) -> EchoSummary {
        self.counters.snapshot()
    }

    /// Fail with the worker's captured error, if it stopped with one.
    pub fn check(&self) -> Result<()> {
        let error = self.thread.error();
        if error.is_empty() {
            Ok(())
        } else {
            Err(EchoError::Worker(error))
        }
    }
}
