//! Thin wrappers over the Linux calls the primitives are built on.
//!
//! Every descriptor created here is non-blocking and close-on-exec, and is
//! returned as an [`OwnedFd`] so that dropping the owner closes it.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use tracing::debug;

use crate::handle::{Handle, Timeout};
use crate::{Result, SyncError};

/// Take ownership of a freshly created descriptor, or report the failure.
fn owned(call: &'static str, fd: RawFd) -> Result<OwnedFd> {
    if fd < 0 {
        return Err(SyncError::last_os_error(call));
    }
    // SAFETY: the descriptor was just returned by the kernel and nothing
    // else holds it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// Poll one handle for readability.
///
/// Returns `None` when the timeout expired, otherwise the `revents` mask.
/// Interrupted calls are retried.
pub(crate) fn poll_handle(handle: Handle, timeout: Timeout) -> Result<Option<i16>> {
    let mut poll_data = libc::pollfd {
        fd: handle.as_raw(),
        events: libc::POLLIN,
        revents: 0,
    };

    loop {
        // SAFETY: `poll_data` is a valid pollfd array of length one.
        let ret = unsafe { libc::poll(&raw mut poll_data, 1, timeout.as_poll_millis()) };
        match ret {
            0 => return Ok(None),
            1 => return Ok(Some(poll_data.revents)),
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(SyncError::Syscall {
                        call: "poll",
                        source: err,
                    });
                }
            }
        }
    }
}

/// Create an eventfd counter.
pub(crate) fn eventfd(initial: u32, semaphore_mode: bool) -> Result<OwnedFd> {
    let mut flags = libc::EFD_NONBLOCK | libc::EFD_CLOEXEC;
    if semaphore_mode {
        flags |= libc::EFD_SEMAPHORE;
    }
    // SAFETY: plain syscall without pointer arguments.
    owned("eventfd", unsafe { libc::eventfd(initial, flags) })
}

/// Read an eventfd or timerfd counter.
///
/// Returns `None` when the counter is zero (the read would block).
pub(crate) fn read_counter(fd: RawFd, call: &'static str) -> Result<Option<u64>> {
    let mut value: u64 = 0;
    // SAFETY: `value` is a valid 8 byte buffer.
    let ret = unsafe { libc::read(fd, (&raw mut value).cast::<libc::c_void>(), 8) };
    if ret == 8 {
        return Ok(Some(value));
    }
    let err = io::Error::last_os_error();
    if ret < 0 && would_block(&err) {
        Ok(None)
    } else {
        Err(SyncError::Syscall { call, source: err })
    }
}

/// Add `value` to an eventfd counter.
///
/// Returns `false` when the counter would overflow (the write would block).
pub(crate) fn write_counter(fd: RawFd, value: u64, call: &'static str) -> Result<bool> {
    // SAFETY: `value` is a valid 8 byte buffer.
    let ret = unsafe { libc::write(fd, (&raw const value).cast::<libc::c_void>(), 8) };
    if ret == 8 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if ret < 0 && would_block(&err) {
        Ok(false)
    } else {
        Err(SyncError::Syscall { call, source: err })
    }
}

/// Non-blocking read. Returns `None` when nothing is available.
pub(crate) fn read_bytes(
    fd: RawFd,
    buffer: &mut [u8],
    call: &'static str,
) -> Result<Option<usize>> {
    // SAFETY: the pointer and length describe `buffer`.
    let ret = unsafe { libc::read(fd, buffer.as_mut_ptr().cast::<libc::c_void>(), buffer.len()) };
    if ret >= 0 {
        return Ok(Some(ret as usize));
    }
    let err = io::Error::last_os_error();
    if would_block(&err) {
        Ok(None)
    } else {
        Err(SyncError::Syscall { call, source: err })
    }
}

/// Non-blocking write. Returns `None` when the pipe is full.
pub(crate) fn write_bytes(fd: RawFd, buffer: &[u8], call: &'static str) -> Result<Option<usize>> {
    // SAFETY: the pointer and length describe `buffer`.
    let ret = unsafe { libc::write(fd, buffer.as_ptr().cast::<libc::c_void>(), buffer.len()) };
    if ret >= 0 {
        return Ok(Some(ret as usize));
    }
    let err = io::Error::last_os_error();
    if would_block(&err) {
        Ok(None)
    } else {
        Err(SyncError::Syscall { call, source: err })
    }
}

/// Create an anonymous pipe, returning `(read end, write end)`.
pub(crate) fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [-1; 2];
    // SAFETY: `fds` is a valid array of two descriptors.
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if ret != 0 {
        return Err(SyncError::last_os_error("pipe2"));
    }
    Ok((owned("pipe2", fds[0])?, owned("pipe2", fds[1])?))
}

/// Grow the buffer of a pipe or FIFO to hold at least `wanted` bytes.
///
/// Returns the resulting capacity in bytes. A refused resize leaves the
/// current capacity in place and is not an error.
pub(crate) fn grow_pipe(fd: RawFd, wanted: u32) -> Result<u32> {
    // SAFETY: F_GETPIPE_SZ takes no argument.
    let current = unsafe { libc::fcntl(fd, libc::F_GETPIPE_SZ) };
    if current < 0 {
        return Err(SyncError::last_os_error("fcntl(F_GETPIPE_SZ)"));
    }
    let current = u32::try_from(current).unwrap_or(0);
    if current >= wanted {
        return Ok(current);
    }

    let request = libc::c_int::try_from(wanted).unwrap_or(libc::c_int::MAX);
    // SAFETY: F_SETPIPE_SZ takes the new size as an int.
    let resized = unsafe { libc::fcntl(fd, libc::F_SETPIPE_SZ, request) };
    if resized < 0 {
        debug!(
            "Pipe resize to {wanted} bytes refused: {}",
            io::Error::last_os_error()
        );
        return Ok(current);
    }
    Ok(u32::try_from(resized).unwrap_or(current))
}

/// Number of bytes queued in a pipe or FIFO.
pub(crate) fn bytes_available(fd: RawFd) -> Result<u32> {
    let mut available: libc::c_int = 0;
    // SAFETY: FIONREAD writes one c_int through the pointer.
    let ret = unsafe { libc::ioctl(fd, libc::FIONREAD, &raw mut available) };
    if ret != 0 {
        return Err(SyncError::last_os_error("ioctl(FIONREAD)"));
    }
    Ok(u32::try_from(available).unwrap_or(0))
}

/// Open an existing FIFO for reading and writing.
pub(crate) fn open_fifo(path: &std::path::Path) -> Result<OwnedFd> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| SyncError::InvalidOperation(format!("invalid path {}", path.display())))?;
    // SAFETY: `c_path` is a valid NUL terminated string.
    let fd = unsafe {
        libc::open(
            c_path.as_ptr(),
            libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
        )
    };
    if fd < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::ENOENT) {
        return Err(SyncError::NotFound(path.to_path_buf()));
    }
    owned("open", fd)
}

/// Create a FIFO with owner-only permissions.
pub(crate) fn make_fifo(path: &std::path::Path) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| SyncError::InvalidOperation(format!("invalid path {}", path.display())))?;
    // SAFETY: `c_path` is a valid NUL terminated string.
    if unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) } != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EEXIST) {
            return Err(SyncError::AlreadyExists(path.to_path_buf()));
        }
        return Err(SyncError::Syscall {
            call: "mkfifo",
            source: err,
        });
    }
    Ok(())
}

/// Create a monotonic timerfd.
pub(crate) fn timerfd() -> Result<OwnedFd> {
    // SAFETY: plain syscall without pointer arguments.
    owned("timerfd_create", unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    })
}

/// Arm or disarm a timerfd. A zero `value_ms` disarms it.
pub(crate) fn timerfd_settime(fd: RawFd, value_ms: u32, interval_ms: u32) -> Result<()> {
    const fn timespec(ms: u32) -> libc::timespec {
        libc::timespec {
            tv_sec: (ms / 1000) as libc::time_t,
            tv_nsec: ((ms % 1000) * 1_000_000) as libc::c_long,
        }
    }

    let spec = libc::itimerspec {
        it_interval: timespec(interval_ms),
        it_value: timespec(value_ms),
    };
    // SAFETY: `spec` is a valid itimerspec; the old value is not requested.
    let ret = unsafe { libc::timerfd_settime(fd, 0, &raw const spec, std::ptr::null_mut()) };
    if ret != 0 {
        return Err(SyncError::last_os_error("timerfd_settime"));
    }
    Ok(())
}

/// Create an epoll instance.
pub(crate) fn epoll_create() -> Result<OwnedFd> {
    // SAFETY: plain syscall without pointer arguments.
    owned("epoll_create1", unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })
}

/// Register or unregister a handle with an epoll instance.
pub(crate) fn epoll_ctl(epoll: RawFd, op: libc::c_int, handle: Handle) -> io::Result<()> {
    let mut event = libc::epoll_event {
        events: libc::EPOLLIN as u32,
        u64: handle.as_raw() as u64,
    };
    // SAFETY: `event` is a valid epoll_event for the duration of the call.
    let ret = unsafe { libc::epoll_ctl(epoll, op, handle.as_raw(), &raw mut event) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Wait for one ready registration.
///
/// Returns `None` on timeout, otherwise the registered handle and its event
/// mask. Interrupted calls surface as `ErrorKind::Interrupted`.
pub(crate) fn epoll_wait_one(epoll: RawFd, timeout: Timeout) -> io::Result<Option<(Handle, u32)>> {
    let mut event = libc::epoll_event { events: 0, u64: 0 };
    // SAFETY: `event` is a valid buffer for one epoll_event.
    let ret = unsafe { libc::epoll_wait(epoll, &raw mut event, 1, timeout.as_poll_millis()) };
    match ret {
        0 => Ok(None),
        1 => {
            let data = event.u64;
            let mask = event.events;
            Ok(Some((Handle::from_raw(data as RawFd), mask)))
        }
        _ => Err(io::Error::last_os_error()),
    }
}

/// Current process id.
pub fn process_id() -> u32 {
    std::process::id()
}

/// Kernel id of the calling thread.
pub fn thread_id() -> u64 {
    // SAFETY: gettid has no arguments and cannot fail.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    tid as u64
}
