//! Error types for synchronization primitives and worker threads

use std::path::PathBuf;

use thiserror::Error;

use crate::handle::Handle;

/// Errors that can occur while creating, waiting on or signalling a
/// synchronization object.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The handle is the invalid sentinel or otherwise unusable.
    #[error("Invalid handle: {0}")]
    InvalidHandle(Handle),

    /// A system call failed.
    #[error("{call} failed: {source}")]
    Syscall {
        /// Name of the failing call
        call: &'static str,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// The caller does not own the object it tried to release.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The operation is not valid in the object's current state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Posting would push a semaphore past its maximum count.
    #[error("Semaphore full (maximum count {max})")]
    SemaphoreFull {
        /// Maximum count of the semaphore
        max: u32,
    },

    /// A bounded wait expired before the object became ready.
    #[error("Wait timed out")]
    TimedOut,

    /// The handle reported a hang-up or error while being waited on.
    #[error("Handle abandoned: {0}")]
    Abandoned(Handle),

    /// A named object already exists.
    #[error("Already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    /// A named object does not exist.
    #[error("Not found: {}", .0.display())]
    NotFound(PathBuf),
}

impl SyncError {
    /// Build a [`SyncError::Syscall`] from the calling thread's `errno`.
    pub fn last_os_error(call: &'static str) -> Self {
        Self::Syscall {
            call,
            source: std::io::Error::last_os_error(),
        }
    }

    /// Check whether the error wraps a specific `errno` value.
    pub fn is_errno(&self, errno: i32) -> bool {
        matches!(self, Self::Syscall { source, .. } if source.raw_os_error() == Some(errno))
    }
}
