//! Anonymous byte pipe.

use std::os::fd::{AsRawFd, OwnedFd};

use crate::handle::{Handle, WaitObject};
use crate::{Result, sys};

/// Non-blocking pipe whose read end is the wait handle.
///
/// The pipe is ready while unread bytes are queued.
#[derive(Debug)]
pub struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl Pipe {
    /// Create a pipe.
    pub fn new() -> Result<Self> {
        let (read, write) = sys::pipe()?;
        Ok(Self { read, write })
    }

    /// Write as much of `data` as the pipe accepts, returning the byte count.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        Ok(sys::write_bytes(self.write.as_raw_fd(), data, "write(pipe)")?.unwrap_or(0))
    }

    /// Read up to `buffer.len()` bytes, returning the byte count.
    ///
    /// Returns zero when nothing is queued.
    pub fn receive(&self, buffer: &mut [u8]) -> Result<usize> {
        Ok(sys::read_bytes(self.read.as_raw_fd(), buffer, "read(pipe)")?.unwrap_or(0))
    }

    /// Bytes currently queued.
    pub fn available(&self) -> Result<u32> {
        sys::bytes_available(self.read.as_raw_fd())
    }
}

impl WaitObject for Pipe {
    fn handle(&self) -> Handle {
        Handle::from_raw(self.read.as_raw_fd())
    }
}
