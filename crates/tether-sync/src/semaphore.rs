//! Bounded counting semaphore backed by a pipe.
//!
//! Each unit of count is one byte queued in the pipe: posting writes bytes,
//! acquiring reads one. The read end is readable exactly while the count is
//! non-zero, which makes the semaphore waitable. Named semaphores use a
//! FIFO on the filesystem so that unrelated processes can share the count.
//!
//! The pipe buffer bounds the count, so the maximum a semaphore reports is
//! the smaller of the requested maximum and the buffer capacity.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::handle::{Handle, Timeout, WaitObject, WaitResult, wait_for_object};
use crate::{Result, SyncError, sys};

/// Counting semaphore with a maximum count.
///
/// Waiting on the semaphore through a wait set acquires one count.
#[derive(Debug)]
pub struct Semaphore {
    read: OwnedFd,
    write: OwnedFd,
    max_count: u32,
    /// FIFO path for named semaphores, removed on drop by the creator.
    path: Option<PathBuf>,
    owns_path: bool,
}

impl Semaphore {
    /// Largest pipe buffer a semaphore asks the kernel for.
    pub const CAPACITY_LIMIT: u32 = 1 << 20;

    /// Create an anonymous semaphore.
    pub fn new(max_count: u32, initial_count: u32) -> Result<Self> {
        let (read, write) = sys::pipe()?;
        let max_count = Self::reserve(write.as_raw_fd(), max_count)?;
        let semaphore = Self {
            read,
            write,
            max_count,
            path: None,
            owns_path: false,
        };
        semaphore.seed(initial_count)?;
        Ok(semaphore)
    }

    /// Create a named semaphore at `path`.
    ///
    /// Fails with [`SyncError::AlreadyExists`] if the path is taken. The
    /// FIFO is removed when the creating handle is dropped.
    pub fn create_named(path: &Path, max_count: u32, initial_count: u32) -> Result<Self> {
        sys::make_fifo(path)?;
        let fd = match sys::open_fifo(path) {
            Ok(fd) => fd,
            Err(e) => {
                let _ = std::fs::remove_file(path);
                return Err(e);
            }
        };
        let write = fd
            .try_clone()
            .map_err(|source| SyncError::Syscall { call: "dup", source })?;
        let max_count = match Self::reserve(fd.as_raw_fd(), max_count) {
            Ok(max_count) => max_count,
            Err(e) => {
                let _ = std::fs::remove_file(path);
                return Err(e);
            }
        };
        let semaphore = Self {
            read: fd,
            write,
            max_count,
            path: Some(path.to_path_buf()),
            owns_path: true,
        };
        semaphore.seed(initial_count)?;
        debug!("Created named semaphore {}", path.display());
        Ok(semaphore)
    }

    /// Open a named semaphore created by another handle or process.
    pub fn open_named(path: &Path, max_count: u32) -> Result<Self> {
        let fd = sys::open_fifo(path)?;
        let write = fd
            .try_clone()
            .map_err(|source| SyncError::Syscall { call: "dup", source })?;
        let max_count = Self::reserve(fd.as_raw_fd(), max_count)?;
        debug!("Opened named semaphore {}", path.display());
        Ok(Self {
            read: fd,
            write,
            max_count,
            path: Some(path.to_path_buf()),
            owns_path: false,
        })
    }

    /// Size the pipe for `max_count` tokens and return the usable maximum.
    fn reserve(fd: RawFd, max_count: u32) -> Result<u32> {
        let capacity = sys::grow_pipe(fd, max_count.min(Self::CAPACITY_LIMIT))?;
        if capacity < max_count {
            debug!("Semaphore maximum {max_count} clamped to pipe capacity {capacity}");
        }
        Ok(max_count.min(capacity))
    }

    fn seed(&self, initial_count: u32) -> Result<()> {
        if initial_count > self.max_count {
            return Err(SyncError::SemaphoreFull {
                max: self.max_count,
            });
        }
        self.unlock(initial_count)
    }

    /// Acquire one count, blocking for at most `timeout`.
    pub fn lock(&self, timeout: Timeout) -> Result<()> {
        match wait_for_object(self, timeout)? {
            WaitResult::Success => Ok(()),
            WaitResult::Timeout => Err(SyncError::TimedOut),
            WaitResult::Abandoned | WaitResult::Error => Err(SyncError::Abandoned(self.handle())),
        }
    }

    /// Acquire one count if available.
    pub fn try_lock(&self) -> Result<bool> {
        let mut token = [0u8; 1];
        Ok(matches!(
            sys::read_bytes(self.read.as_raw_fd(), &mut token, "read(semaphore)")?,
            Some(1)
        ))
    }

    /// Post `count` units, all or nothing.
    ///
    /// Fails with [`SyncError::SemaphoreFull`] when the result would exceed
    /// the maximum count. Nothing is posted in that case.
    pub fn unlock(&self, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let current = self.count()?;
        if current.saturating_add(count) > self.max_count {
            return Err(SyncError::SemaphoreFull {
                max: self.max_count,
            });
        }
        if self.post(count)? < count {
            return Err(SyncError::SemaphoreFull {
                max: self.max_count,
            });
        }
        Ok(())
    }

    /// Post as many of `count` units as fit below the maximum.
    ///
    /// Returns the number actually posted.
    pub fn try_unlock(&self, count: u32) -> Result<u32> {
        let room = self.max_count.saturating_sub(self.count()?);
        self.post(count.min(room))
    }

    fn post(&self, count: u32) -> Result<u32> {
        let tokens = vec![0u8; count as usize];
        let mut posted = 0usize;
        while posted < tokens.len() {
            match sys::write_bytes(self.write.as_raw_fd(), &tokens[posted..], "write(semaphore)")? {
                Some(written) if written > 0 => posted += written,
                _ => break,
            }
        }
        Ok(u32::try_from(posted).unwrap_or(u32::MAX))
    }

    /// Current count.
    pub fn count(&self) -> Result<u32> {
        sys::bytes_available(self.read.as_raw_fd())
    }

    /// Maximum count.
    pub const fn max_count(&self) -> u32 {
        self.max_count
    }

    /// FIFO path of a named semaphore.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl WaitObject for Semaphore {
    fn handle(&self) -> Handle {
        Handle::from_raw(self.read.as_raw_fd())
    }

    fn post_wait(&self, result: WaitResult) -> WaitResult {
        if result != WaitResult::Success {
            return result;
        }
        match self.try_lock() {
            Ok(true) => WaitResult::Success,
            Ok(false) => WaitResult::Timeout,
            Err(_) => WaitResult::Error,
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if self.owns_path {
            if let Some(path) = &self.path {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}
