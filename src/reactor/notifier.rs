//! Cross-thread wakeup for the event loop.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::error::Result;

/// Non-blocking eventfd used to interrupt a backend wait.
///
/// Any thread may [`notify`](Self::notify); the backend owning the loop either
/// keeps a read armed on the descriptor (io_uring) or polls it (blocking).
#[derive(Debug)]
pub struct Notifier {
    fd: RawFd,
}

impl Notifier {
    pub fn new() -> Result<Self> {
        // SAFETY: plain syscall, no pointers.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self { fd })
    }

    /// Bump the counter, waking a loop blocked in its backend.
    pub fn notify(&self) -> Result<()> {
        let one = 1u64;
        // SAFETY: writes eight bytes from a local.
        let written = unsafe {
            libc::write(
                self.fd,
                (&one as *const u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if written < 0 {
            let err = io::Error::last_os_error();
            // A saturated counter still wakes the reader.
            if err.raw_os_error() != Some(libc::EAGAIN) {
                return Err(err.into());
            }
        }
        Ok(())
    }
}

impl AsRawFd for Notifier {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        // SAFETY: the descriptor is owned and closed exactly once.
        unsafe {
            libc::close(self.fd);
        }
    }
}
