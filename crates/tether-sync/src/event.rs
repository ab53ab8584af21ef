//! Manual and auto-reset events backed by eventfd.

use std::os::fd::{AsRawFd, OwnedFd};

use crate::handle::{Handle, Timeout, WaitObject, WaitResult, wait_for_object};
use crate::{Result, sys};

/// A signal that can be set, reset and waited on.
///
/// A manual-reset event stays set until [`Event::reset`] is called. An
/// auto-reset event is cleared by whichever waiter observes it, so each
/// `set` wakes at most one waiter.
#[derive(Debug)]
pub struct Event {
    fd: OwnedFd,
    manual_reset: bool,
}

impl Event {
    /// Create an event.
    pub fn new(manual_reset: bool, initially_set: bool) -> Result<Self> {
        let fd = sys::eventfd(u32::from(initially_set), false)?;
        Ok(Self { fd, manual_reset })
    }

    /// Signal the event.
    pub fn set(&self) -> Result<()> {
        // A full counter is still a set event.
        sys::write_counter(self.fd.as_raw_fd(), 1, "write(eventfd)")?;
        Ok(())
    }

    /// Clear the event.
    pub fn reset(&self) -> Result<()> {
        sys::read_counter(self.fd.as_raw_fd(), "read(eventfd)")?;
        Ok(())
    }

    /// Check whether the event is currently set without clearing it.
    pub fn is_set(&self) -> Result<bool> {
        Ok(sys::poll_handle(self.handle(), Timeout::POLL)?.is_some())
    }

    /// Whether the event stays set after a wait.
    pub const fn is_manual_reset(&self) -> bool {
        self.manual_reset
    }

    /// Block until the event is set.
    pub fn wait(&self, timeout: Timeout) -> Result<WaitResult> {
        wait_for_object(self, timeout)
    }
}

impl WaitObject for Event {
    fn handle(&self) -> Handle {
        Handle::from_raw(self.fd.as_raw_fd())
    }

    fn post_wait(&self, result: WaitResult) -> WaitResult {
        if result != WaitResult::Success || self.manual_reset {
            return result;
        }
        match sys::read_counter(self.fd.as_raw_fd(), "read(eventfd)") {
            Ok(Some(_)) => WaitResult::Success,
            Ok(None) => WaitResult::Timeout,
            Err(_) => WaitResult::Error,
        }
    }
}
