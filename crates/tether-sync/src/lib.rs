//! Waitable synchronization primitives and cooperative worker threads.
//!
//! Everything in this crate is built around the [`WaitObject`] capability:
//! an OS handle that can be blocked on, plus optional hooks that run before
//! and after the wait. The pieces stack as follows:
//!
//! - **Primitives**: [`Event`], [`Mutex`], [`Semaphore`], [`Timer`] and
//!   [`Pipe`], each backed by a Linux file descriptor (eventfd, timerfd,
//!   pipe or FIFO) so that any of them can be multiplexed.
//! - **[`WaitSet`]**: an epoll registration over many wait objects that
//!   reports exactly one ready handle per call.
//! - **[`CooperativeThread`]**: a dedicated worker that loops over a wait
//!   set and dispatches readiness to a user supplied [`Worker`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tether_sync::{Event, Timeout, WaitObject, WaitResult, WaitSet};
//!
//! # fn example() -> tether_sync::Result<()> {
//! let event = Arc::new(Event::new(false, false)?);
//! let mut set = WaitSet::new()?;
//! set.add(event.clone())?;
//!
//! event.set()?;
//! let wake = set.wait_any(Timeout::from_millis(100))?;
//! assert_eq!(wake.result, WaitResult::Success);
//! assert_eq!(wake.handle, event.handle());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

// Handles, timeouts and the wait capability
pub mod handle;

// Error types
pub mod error;

// Thread configuration
pub mod config;

// Platform primitives
pub mod event;
pub mod mutex;
pub mod object;
pub mod pipe;
pub mod semaphore;
pub mod timer;

// Multiplexed waiting
pub mod wait_set;

// Cooperative worker threads
pub mod thread;

// Raw syscall helpers
mod sys;

pub use config::ThreadConfig;
pub use error::SyncError;
pub use event::Event;
pub use handle::{Handle, Timeout, WaitObject, WaitResult, wait_for_object};
pub use mutex::Mutex;
pub use object::SyncObject;
pub use pipe::Pipe;
pub use semaphore::Semaphore;
pub use sys::{process_id, thread_id};
pub use thread::{BoxError, CooperativeThread, ThreadControl, ThreadState, Worker, WorkerResult};
pub use timer::Timer;
pub use wait_set::{WaitEvent, WaitSet};

/// Result type for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;
