//! Handles, timeouts and the [`WaitObject`] capability.
//!
//! A [`Handle`] is the file descriptor an object exposes for blocking.
//! Anything that implements [`WaitObject`] can be passed to
//! [`wait_for_object`] or registered in a [`WaitSet`](crate::WaitSet).

use std::fmt;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::sys;

/// Opaque OS-level identifier that a wait can block on.
///
/// On Linux this is a file descriptor. [`Handle::INVALID`] is the reserved
/// sentinel meaning "no handle"; it is also what worker callbacks receive
/// when a wait timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(RawFd);

impl Handle {
    /// The reserved invalid handle.
    pub const INVALID: Self = Self(-1);

    /// Wrap a raw file descriptor.
    pub const fn from_raw(fd: RawFd) -> Self {
        Self(fd)
    }

    /// Get the raw file descriptor.
    pub const fn as_raw(self) -> RawFd {
        self.0
    }

    /// Check whether this is a usable handle.
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "fd {}", self.0)
        } else {
            f.write_str("invalid")
        }
    }
}

/// How long a wait may block.
///
/// `Millis(0)` polls once without blocking, [`Timeout::Infinite`] blocks
/// until the object is ready. Granularity is whatever the kernel provides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeout {
    /// Block until ready.
    #[default]
    Infinite,
    /// Block for at most this many milliseconds.
    Millis(u32),
}

impl Timeout {
    /// Poll once without blocking.
    pub const POLL: Self = Self::Millis(0);

    /// Timeout of `ms` milliseconds.
    pub const fn from_millis(ms: u32) -> Self {
        Self::Millis(ms)
    }

    /// Check whether this is a non-blocking poll.
    pub const fn is_poll(self) -> bool {
        matches!(self, Self::Millis(0))
    }

    /// The value `poll(2)` and `epoll_wait(2)` expect.
    pub fn as_poll_millis(self) -> libc::c_int {
        match self {
            Self::Infinite => -1,
            Self::Millis(ms) => libc::c_int::try_from(ms).unwrap_or(libc::c_int::MAX),
        }
    }

    /// Time left of this timeout for a wait that began at `started`.
    pub fn remaining(self, started: Instant) -> Self {
        match self {
            Self::Infinite => Self::Infinite,
            Self::Millis(ms) => {
                let left = u128::from(ms).saturating_sub(started.elapsed().as_millis());
                Self::Millis(u32::try_from(left).unwrap_or(0))
            }
        }
    }

    /// Check whether a wait that began at `started` has used up this timeout.
    pub fn is_expired(self, started: Instant) -> bool {
        self.remaining(started).is_poll() && !matches!(self, Self::Infinite)
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Self::Millis(u32::try_from(duration.as_millis()).unwrap_or(u32::MAX))
    }
}

/// Outcome of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitResult {
    /// The object became ready.
    Success,
    /// The timeout expired first.
    Timeout,
    /// The handle reported a hang-up or per-handle fault; the other side is
    /// most likely gone.
    Abandoned,
    /// The wait itself failed at the OS level.
    Error,
}

/// Anything exposing a waitable handle plus optional pre/post-wait hooks.
///
/// `pre_wait` runs before any system call; returning `true` reports the
/// object as already satisfied and skips the call. `post_wait` observes the
/// outcome and may claim the condition (consume a semaphore count, record a
/// mutex owner, reset an auto-reset event). When the condition was claimed
/// by a competing waiter first, `post_wait` returns [`WaitResult::Timeout`]
/// and the waiter re-arms for whatever time is left.
pub trait WaitObject: Send + Sync {
    /// The handle to block on.
    fn handle(&self) -> Handle;

    /// Report whether the object is already satisfied.
    fn pre_wait(&self) -> bool {
        false
    }

    /// Observe, and possibly claim, the outcome of a wait.
    fn post_wait(&self, result: WaitResult) -> WaitResult {
        result
    }
}

/// Block on a single object.
///
/// Applies the same hook semantics as [`WaitSet::wait_any`](crate::WaitSet::wait_any):
/// the pre-wait fast path, a claiming post-wait hook, and `Abandoned` for a
/// hang-up or error on the handle.
pub fn wait_for_object<T: WaitObject + ?Sized>(object: &T, timeout: Timeout) -> Result<WaitResult> {
    if object.pre_wait() && object.post_wait(WaitResult::Success) == WaitResult::Success {
        return Ok(WaitResult::Success);
    }

    let started = Instant::now();
    loop {
        let remaining = timeout.remaining(started);
        let Some(revents) = sys::poll_handle(object.handle(), remaining)? else {
            return Ok(WaitResult::Timeout);
        };

        if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            object.post_wait(WaitResult::Abandoned);
            return Ok(WaitResult::Abandoned);
        }

        match object.post_wait(WaitResult::Success) {
            WaitResult::Timeout if !timeout.is_expired(started) => {}
            result => return Ok(result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_handle() {
        assert!(!Handle::INVALID.is_valid());
        assert!(Handle::from_raw(0).is_valid());
        assert_eq!(Handle::INVALID.to_string(), "invalid");
        assert_eq!(Handle::from_raw(7).to_string(), "fd 7");
    }

    #[test]
    fn test_timeout_poll_millis() {
        assert_eq!(Timeout::Infinite.as_poll_millis(), -1);
        assert_eq!(Timeout::POLL.as_poll_millis(), 0);
        assert_eq!(Timeout::from_millis(250).as_poll_millis(), 250);
        assert_eq!(
            Timeout::from_millis(u32::MAX).as_poll_millis(),
            libc::c_int::MAX
        );
    }

    #[test]
    fn test_timeout_remaining() {
        let started = Instant::now();
        assert_eq!(Timeout::Infinite.remaining(started), Timeout::Infinite);
        assert!(!Timeout::Infinite.is_expired(started));
        assert!(Timeout::POLL.is_expired(started));

        let long = Timeout::from_millis(60_000);
        match long.remaining(started) {
            Timeout::Millis(ms) => assert!(ms > 59_000),
            Timeout::Infinite => unreachable!("finite timeout stays finite"),
        }
    }

    #[test]
    fn test_timeout_from_duration() {
        assert_eq!(
            Timeout::from(Duration::from_millis(1500)),
            Timeout::Millis(1500)
        );
    }
}
