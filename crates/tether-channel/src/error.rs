//! Error types for shared regions, headers and channels

use thiserror::Error;
use tether_sync::SyncError;

use crate::layout::MessageState;

/// Errors that can occur while setting up or using a channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// A region or semaphore with this name already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// No region or semaphore with this name exists.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The region exists but its creator never finished initializing it.
    #[error("Shared region {0} was never initialized")]
    NotInitialized(String),

    /// A system call failed.
    #[error("{call} failed: {source}")]
    Syscall {
        /// Name of the failing call
        call: &'static str,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// No free block can hold the requested length, even after reclaiming.
    #[error("Out of space: requested {requested} bytes, largest free block holds {largest_free}")]
    OutOfSpace {
        /// Payload length asked for
        requested: u32,
        /// Payload capacity of the largest free block
        largest_free: u32,
    },

    /// The message is not in a state the operation accepts.
    #[error("Message at offset {offset:#x} is in state {state:?}")]
    InvalidState {
        /// Block offset within the region
        offset: u32,
        /// State found, `None` if the state word is not a known state
        state: Option<MessageState>,
    },

    /// The region size cannot hold the layout.
    #[error("Invalid region size {size}: must be a multiple of 8 and at least {min}")]
    InvalidSize {
        /// Size asked for
        size: u32,
        /// Smallest usable size
        min: u32,
    },

    /// A configuration value is unusable.
    #[error("Invalid channel configuration: {0}")]
    InvalidConfig(String),

    /// The message belongs to neither direction of this channel.
    #[error("Message does not belong to this channel")]
    ForeignMessage,

    /// A count was available but the queue stayed behind an unfinished send.
    #[error("Receive queue stalled behind an unfinished send")]
    QueueStalled,

    /// A link or size inside the region points outside of it.
    #[error("Corrupt block link at offset {offset:#x}")]
    Corrupted {
        /// Offending offset
        offset: u32,
    },

    /// Semaphore or wait failure.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl ChannelError {
    /// Build a [`ChannelError::Syscall`] from the calling thread's `errno`.
    pub fn last_os_error(call: &'static str) -> Self {
        Self::Syscall {
            call,
            source: std::io::Error::last_os_error(),
        }
    }

    /// Map named-object failures of a semaphore to the channel's own kinds.
    pub(crate) fn from_named(err: SyncError) -> Self {
        match err {
            SyncError::AlreadyExists(path) => Self::AlreadyExists(path.display().to_string()),
            SyncError::NotFound(path) => Self::NotFound(path.display().to_string()),
            other => Self::Sync(other),
        }
    }

    /// Check whether a receive failed only because nothing arrived in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Sync(SyncError::TimedOut))
    }
}
