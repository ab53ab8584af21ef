//! POSIX shared memory regions using `shm_open`.
//!
//! The creator opens the object with `O_CREAT | O_EXCL` and owner-only
//! permissions (0600), sizes it, maps it and later publishes the ready
//! magic. Openers map the existing object and spin, with bounded retries,
//! until the magic appears. The creator unlinks the name on drop; mappings
//! held by openers stay valid until they are dropped too.

#![allow(unsafe_code)]

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};
use std::time::Duration;

use libc::{MAP_SHARED, O_CREAT, O_EXCL, O_RDWR, PROT_READ, PROT_WRITE, S_IRUSR, S_IWUSR};
use libc::{c_uint, c_void, mode_t, off_t};
use tracing::{debug, warn};

use crate::layout::{MIN_REGION_SIZE, Prologue, validate_size};
use crate::{ChannelError, Result};

/// A mapped POSIX shared memory object.
#[derive(Debug)]
pub struct SharedRegion {
    ptr: NonNull<u8>,
    size: u32,
    /// Name without the leading `/`
    name: String,
    owner: bool,
}

// SAFETY: the mapping is plain shared memory; all structured access goes
// through atomics in the region layout.
unsafe impl Send for SharedRegion {}
// SAFETY: see above.
unsafe impl Sync for SharedRegion {}

fn shm_path(name: &str) -> Result<CString> {
    CString::new(format!("/{name}"))
        .map_err(|_| ChannelError::InvalidConfig(format!("region name {name:?} contains NUL")))
}

fn map(fd: &OwnedFd, size: u32) -> Result<NonNull<u8>> {
    // SAFETY: mapping a valid descriptor with no fixed address.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size as usize,
            PROT_READ | PROT_WRITE,
            MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(ChannelError::last_os_error("mmap"));
    }
    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| ChannelError::last_os_error("mmap"))
}

fn object_size(fd: &OwnedFd) -> Result<u64> {
    // SAFETY: `stat` is plain data and fully written by fstat on success.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: valid descriptor and stat buffer.
    if unsafe { libc::fstat(fd.as_raw_fd(), &raw mut stat) } != 0 {
        return Err(ChannelError::last_os_error("fstat"));
    }
    Ok(u64::try_from(stat.st_size).unwrap_or(0))
}

impl SharedRegion {
    /// Create a new region of `size` bytes.
    ///
    /// Fails with [`ChannelError::AlreadyExists`] if the name is taken.
    pub fn create(name: &str, size: u32) -> Result<Self> {
        validate_size(size)?;
        let path = shm_path(name)?;

        // SAFETY: valid C string; flags and mode are plain integers.
        let raw = unsafe {
            libc::shm_open(
                path.as_ptr(),
                O_CREAT | O_EXCL | O_RDWR,
                (S_IRUSR | S_IWUSR) as mode_t as c_uint,
            )
        };
        if raw == -1 {
            let err = std::io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EEXIST) => ChannelError::AlreadyExists(name.to_string()),
                _ => ChannelError::Syscall {
                    call: "shm_open",
                    source: err,
                },
            });
        }
        // SAFETY: freshly returned descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let unlink_on_error = |err: ChannelError| {
            // SAFETY: valid C string.
            unsafe { libc::shm_unlink(path.as_ptr()) };
            err
        };

        // SAFETY: valid descriptor.
        if unsafe { libc::ftruncate(fd.as_raw_fd(), off_t::from(size)) } == -1 {
            return Err(unlink_on_error(ChannelError::last_os_error("ftruncate")));
        }
        let ptr = map(&fd, size).map_err(unlink_on_error)?;

        debug!("Created shared region {name} ({size} bytes)");
        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
            owner: true,
        })
    }

    /// Open an existing region and wait for its creator to publish it.
    ///
    /// Each attempt that finds no object, an object still being sized, or
    /// no ready magic sleeps `interval` and tries again, `retries` times in
    /// total. Fails with [`ChannelError::NotFound`] if the object never
    /// appeared and [`ChannelError::NotInitialized`] if it never became
    /// ready.
    pub fn open(name: &str, retries: u32, interval: Duration) -> Result<Self> {
        let path = shm_path(name)?;
        let mut seen = false;

        for attempt in 0..retries.max(1) {
            if attempt > 0 {
                std::thread::sleep(interval);
            }

            // SAFETY: valid C string.
            let raw = unsafe { libc::shm_open(path.as_ptr(), O_RDWR, 0) };
            if raw == -1 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ENOENT) {
                    continue;
                }
                return Err(ChannelError::Syscall {
                    call: "shm_open",
                    source: err,
                });
            }
            seen = true;
            // SAFETY: freshly returned descriptor owned by nobody else.
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };

            let size = object_size(&fd)?;
            let Ok(size) = u32::try_from(size) else {
                return Err(ChannelError::InvalidSize {
                    size: u32::MAX,
                    min: MIN_REGION_SIZE,
                });
            };
            if size < MIN_REGION_SIZE {
                // Creator has not sized it yet
                continue;
            }

            let region = Self {
                ptr: map(&fd, size)?,
                size,
                name: name.to_string(),
                owner: false,
            };
            if region.prologue().is_ready() {
                debug!("Opened shared region {name} ({size} bytes)");
                return Ok(region);
            }
        }

        if seen {
            warn!("Shared region {name} was never published");
            Err(ChannelError::NotInitialized(name.to_string()))
        } else {
            Err(ChannelError::NotFound(name.to_string()))
        }
    }

    fn prologue(&self) -> &Prologue {
        // SAFETY: the mapping is page aligned and at least MIN_REGION_SIZE
        // bytes; the prologue consists of atomics only.
        unsafe { self.ptr.cast::<Prologue>().as_ref() }
    }

    /// Base address of the mapping.
    pub const fn base(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Size of the mapping in bytes.
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Name without the leading `/`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle created the object and unlinks it on drop.
    pub const fn is_owner(&self) -> bool {
        self.owner
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`size` describe a live mapping created by `map`.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast::<c_void>(), self.size as usize);
        }
        if self.owner {
            if let Ok(path) = shm_path(&self.name) {
                // SAFETY: valid C string.
                unsafe { libc::shm_unlink(path.as_ptr()) };
            }
        }
    }
}
