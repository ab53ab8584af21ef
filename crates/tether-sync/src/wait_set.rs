//! Multiplexed waiting over many wait objects.
//!
//! A [`WaitSet`] keeps an epoll registration and a lookup map from handle
//! to object side by side. Every handle registered with epoll has exactly
//! one entry in the map and vice versa.
//!
//! [`WaitSet::wait_any`] reports one ready handle per call. The kernel
//! requeues a level-triggered descriptor behind the other ready ones after
//! reporting it, so a busy set is served in rotation.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error};

use crate::handle::{Handle, Timeout, WaitObject, WaitResult};
use crate::{Result, SyncError, sys};

/// Result of [`WaitSet::wait_any`]: what happened and to which handle.
///
/// `handle` is [`Handle::INVALID`] for a timeout and for a multiplexer
/// fault that cannot be attributed to one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitEvent {
    /// Outcome of the wait.
    pub result: WaitResult,
    /// Handle the outcome applies to.
    pub handle: Handle,
}

impl WaitEvent {
    const fn new(result: WaitResult, handle: Handle) -> Self {
        Self { result, handle }
    }

    const fn timeout() -> Self {
        Self::new(WaitResult::Timeout, Handle::INVALID)
    }
}

/// Collection of wait objects awaited with one blocking call.
pub struct WaitSet {
    epoll: OwnedFd,
    objects: HashMap<Handle, Arc<dyn WaitObject>>,
}

impl WaitSet {
    /// Create an empty wait set.
    pub fn new() -> Result<Self> {
        Ok(Self {
            epoll: sys::epoll_create()?,
            objects: HashMap::new(),
        })
    }

    /// Register an object.
    ///
    /// Returns `false` without changing anything when its handle is already
    /// registered. Fails with [`SyncError::InvalidHandle`] for the invalid
    /// sentinel.
    pub fn add(&mut self, object: Arc<dyn WaitObject>) -> Result<bool> {
        let handle = object.handle();
        if !handle.is_valid() {
            return Err(SyncError::InvalidHandle(handle));
        }
        if self.objects.contains_key(&handle) {
            return Ok(false);
        }

        sys::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, handle).map_err(
            |source| match source.raw_os_error() {
                Some(libc::EBADF | libc::EPERM) => SyncError::InvalidHandle(handle),
                _ => SyncError::Syscall {
                    call: "epoll_ctl(ADD)",
                    source,
                },
            },
        )?;

        self.objects.insert(handle, object);
        debug!("Registered {handle} ({} in set)", self.objects.len());
        Ok(true)
    }

    /// Unregister the object with `handle`.
    ///
    /// Returns `false` when nothing is registered under it.
    pub fn remove(&mut self, handle: Handle) -> Result<bool> {
        if self.objects.remove(&handle).is_none() {
            return Ok(false);
        }

        if let Err(source) = sys::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_DEL, handle) {
            // A closed descriptor has already left the epoll set.
            if !matches!(source.raw_os_error(), Some(libc::EBADF | libc::ENOENT)) {
                return Err(SyncError::Syscall {
                    call: "epoll_ctl(DEL)",
                    source,
                });
            }
        }

        debug!("Unregistered {handle} ({} in set)", self.objects.len());
        Ok(true)
    }

    /// Unregister `object`.
    pub fn remove_object(&mut self, object: &dyn WaitObject) -> Result<bool> {
        self.remove(object.handle())
    }

    /// Check whether `handle` is registered.
    pub fn contains(&self, handle: Handle) -> bool {
        self.objects.contains_key(&handle)
    }

    /// Number of registered objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Check whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Block until one registered object is ready or `timeout` expires.
    ///
    /// Pre-wait hooks are consulted first; the first object reporting
    /// itself satisfied is returned without a system call. Otherwise one
    /// `epoll_wait` covers the whole set and exactly one ready handle is
    /// reported. Its post-wait hook runs before returning. A hang-up or
    /// error on a handle yields [`WaitResult::Abandoned`] for it; a failure
    /// of the wait itself yields [`WaitResult::Error`] with an invalid
    /// handle.
    pub fn wait_any(&mut self, timeout: Timeout) -> Result<WaitEvent> {
        for (handle, object) in &self.objects {
            if object.pre_wait() && object.post_wait(WaitResult::Success) == WaitResult::Success {
                return Ok(WaitEvent::new(WaitResult::Success, *handle));
            }
        }

        let started = Instant::now();
        loop {
            let remaining = timeout.remaining(started);
            let (handle, mask) = match sys::epoll_wait_one(self.epoll.as_raw_fd(), remaining) {
                Ok(Some(ready)) => ready,
                Ok(None) => return Ok(WaitEvent::timeout()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("epoll_wait failed: {e}");
                    return Ok(WaitEvent::new(WaitResult::Error, Handle::INVALID));
                }
            };

            let Some(object) = self.objects.get(&handle) else {
                // Raced with a removal; the registration is already gone.
                continue;
            };

            if mask & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                object.post_wait(WaitResult::Abandoned);
                return Ok(WaitEvent::new(WaitResult::Abandoned, handle));
            }

            match object.post_wait(WaitResult::Success) {
                WaitResult::Timeout if timeout.is_expired(started) => {
                    return Ok(WaitEvent::timeout());
                }
                WaitResult::Timeout => {}
                result => return Ok(WaitEvent::new(result, handle)),
            }
        }
    }
}

impl std::fmt::Debug for WaitSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut handles: Vec<_> = self.objects.keys().copied().collect();
        handles.sort();
        f.debug_struct("WaitSet")
            .field("epoll", &self.epoll)
            .field("handles", &handles)
            .finish()
    }
}
