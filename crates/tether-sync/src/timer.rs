//! Waitable timer backed by timerfd.

use std::os::fd::{AsRawFd, OwnedFd};

use crate::handle::{Handle, WaitObject};
use crate::{Result, sys};

/// Monotonic timer that becomes ready when it expires.
///
/// The timer stays ready until [`Timer::clear`] is called, so a worker
/// woken by it must clear it before waiting again.
#[derive(Debug)]
pub struct Timer {
    fd: OwnedFd,
}

impl Timer {
    /// Create a disarmed timer.
    pub fn new() -> Result<Self> {
        Ok(Self { fd: sys::timerfd()? })
    }

    /// Arm a one-shot expiry after `ms` milliseconds.
    ///
    /// Zero expires as soon as possible.
    pub fn start(&self, ms: u32) -> Result<()> {
        sys::timerfd_settime(self.fd.as_raw_fd(), ms.max(1), 0)
    }

    /// Arm a repeating expiry every `ms` milliseconds.
    pub fn start_periodic(&self, ms: u32) -> Result<()> {
        let ms = ms.max(1);
        sys::timerfd_settime(self.fd.as_raw_fd(), ms, ms)
    }

    /// Disarm the timer. Expirations already counted stay until cleared.
    pub fn stop(&self) -> Result<()> {
        sys::timerfd_settime(self.fd.as_raw_fd(), 0, 0)
    }

    /// Consume pending expirations, returning how many there were.
    pub fn clear(&self) -> Result<u64> {
        Ok(sys::read_counter(self.fd.as_raw_fd(), "read(timerfd)")?.unwrap_or(0))
    }
}

impl WaitObject for Timer {
    fn handle(&self) -> Handle {
        Handle::from_raw(self.fd.as_raw_fd())
    }
}
