//! Waitable, reentrant mutex.
//!
//! The lock token lives in an eventfd in semaphore mode with a count of at
//! most one. Ownership is tracked by kernel thread id so that the owning
//! thread can re-acquire without blocking and nobody else can unlock.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::handle::{Handle, Timeout, WaitObject, WaitResult, wait_for_object};
use crate::{Result, SyncError, sys};

/// No thread owns the mutex.
const NO_OWNER: u64 = 0;

/// Mutex that can be placed in a [`WaitSet`](crate::WaitSet).
///
/// Waiting on the mutex through a wait set acquires it for the waiting
/// thread, exactly as [`Mutex::lock`] would.
#[derive(Debug)]
pub struct Mutex {
    fd: OwnedFd,
    owner: AtomicU64,
    depth: AtomicU32,
}

impl Mutex {
    /// Create a mutex, optionally already held by the calling thread.
    pub fn new(locked: bool) -> Result<Self> {
        let fd = sys::eventfd(u32::from(!locked), true)?;
        let (owner, depth) = if locked {
            (sys::thread_id(), 1)
        } else {
            (NO_OWNER, 0)
        };
        Ok(Self {
            fd,
            owner: AtomicU64::new(owner),
            depth: AtomicU32::new(depth),
        })
    }

    /// Acquire the mutex, blocking for at most `timeout`.
    pub fn lock(&self, timeout: Timeout) -> Result<()> {
        match wait_for_object(self, timeout)? {
            WaitResult::Success => Ok(()),
            WaitResult::Timeout => Err(SyncError::TimedOut),
            WaitResult::Abandoned | WaitResult::Error => Err(SyncError::Abandoned(self.handle())),
        }
    }

    /// Acquire the mutex if it is free or already ours.
    pub fn try_lock(&self) -> Result<bool> {
        Ok(wait_for_object(self, Timeout::POLL)? == WaitResult::Success)
    }

    /// Release one level of ownership.
    ///
    /// Fails with [`SyncError::PermissionDenied`] when the caller is not the
    /// owner.
    pub fn unlock(&self) -> Result<()> {
        if !self.is_owned_by_current_thread() {
            return Err(SyncError::PermissionDenied(
                "attempt to release a mutex not owned by the caller".to_string(),
            ));
        }

        if self.depth.fetch_sub(1, Ordering::AcqRel) > 1 {
            return Ok(());
        }

        self.owner.store(NO_OWNER, Ordering::Release);
        sys::write_counter(self.fd.as_raw_fd(), 1, "write(eventfd)")?;
        Ok(())
    }

    /// Check whether the calling thread holds the mutex.
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Acquire) == sys::thread_id()
    }

    /// How many times the owner has acquired the mutex.
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Acquire)
    }
}

impl WaitObject for Mutex {
    fn handle(&self) -> Handle {
        Handle::from_raw(self.fd.as_raw_fd())
    }

    fn pre_wait(&self) -> bool {
        self.is_owned_by_current_thread()
    }

    fn post_wait(&self, result: WaitResult) -> WaitResult {
        if result != WaitResult::Success {
            return result;
        }

        if self.is_owned_by_current_thread() {
            self.depth.fetch_add(1, Ordering::AcqRel);
            return WaitResult::Success;
        }

        match sys::read_counter(self.fd.as_raw_fd(), "read(eventfd)") {
            Ok(Some(_)) => {
                self.owner.store(sys::thread_id(), Ordering::Release);
                self.depth.store(1, Ordering::Release);
                WaitResult::Success
            }
            Ok(None) => WaitResult::Timeout,
            Err(_) => WaitResult::Error,
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_create_locked_and_unlocked() {
        for i in 0..100 {
            let mutex = Mutex::new(i % 2 == 0).expect("mutex");
            assert_eq!(mutex.is_owned_by_current_thread(), i % 2 == 0);
        }
    }

    #[test]
    fn test_reentrant_lock() {
        let mutex = Mutex::new(false).expect("mutex");
        mutex.lock(Timeout::POLL).expect("lock");
        mutex.lock(Timeout::POLL).expect("relock");
        assert_eq!(mutex.depth(), 2);

        mutex.unlock().expect("unlock");
        assert!(mutex.is_owned_by_current_thread());
        mutex.unlock().expect("unlock");
        assert!(!mutex.is_owned_by_current_thread());
    }

    #[test]
    fn test_unlock_by_non_owner_fails() {
        let mutex = Arc::new(Mutex::new(true).expect("mutex"));
        let other = mutex.clone();
        let result = std::thread::spawn(move || other.unlock())
            .join()
            .expect("join");
        assert!(matches!(result, Err(SyncError::PermissionDenied(_))));

        let unowned = Mutex::new(false).expect("mutex");
        assert!(matches!(unowned.unlock(), Err(SyncError::PermissionDenied(_))));
    }

    #[test]
    fn test_contended_lock_times_out() {
        let mutex = Arc::new(Mutex::new(true).expect("mutex"));
        let other = mutex.clone();
        let result = std::thread::spawn(move || other.lock(Timeout::from_millis(20)))
            .join()
            .expect("join");
        assert!(matches!(result, Err(SyncError::TimedOut)));
    }

    #[test]
    fn test_handoff_between_threads() {
        let mutex = Arc::new(Mutex::new(true).expect("mutex"));
        let other = mutex.clone();
        let waiter = std::thread::spawn(move || {
            other.lock(Timeout::from_millis(2000)).expect("lock");
            let owned = other.is_owned_by_current_thread();
            other.unlock().expect("unlock");
            owned
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        mutex.unlock().expect("unlock");
        assert!(waiter.join().expect("join"));
        assert!(mutex.try_lock().expect("try_lock"));
    }
}
