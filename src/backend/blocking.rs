//! Blocking-syscall fallback backend.
//!
//! Used where io_uring is unavailable, such as older kernels, containers with
//! restricted seccomp profiles, or cloud environments that disable io_uring.
//! Every descriptor is executed synchronously on the event loop thread at push
//! time. Completions are still queued and delivered through [`drain`], so the
//! handle sees the same asynchronous ordering as with io_uring.
//!
//! [`drain`]: Backend::drain

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::backend::{last_errno_result, Backend};
use crate::error::Result;
use crate::operation::OpDescriptor;

/// Backend executing each descriptor with the equivalent libc call.
pub struct BlockingBackend {
    wake_fd: RawFd,
    ready: VecDeque<(u64, i32)>,
}

impl BlockingBackend {
    pub fn new(wake_fd: RawFd) -> Self {
        Self {
            wake_fd,
            ready: VecDeque::new(),
        }
    }

    /// Execute one descriptor, returning a kernel-style result.
    fn execute(op: &OpDescriptor) -> i32 {
        // SAFETY: the descriptor's pointers are valid for the duration of the
        // call per the backend contract; nothing is retained afterwards.
        unsafe {
            match *op {
                OpDescriptor::Read {
                    fd,
                    buf,
                    len,
                    offset,
                } => retry(|| libc::pread(fd, buf.cast(), len as usize, offset as libc::off_t)),
                OpDescriptor::Write {
                    fd,
                    buf,
                    len,
                    offset,
                    dsync,
                } => {
                    let written =
                        retry(|| libc::pwrite(fd, buf.cast(), len as usize, offset as libc::off_t));
                    if dsync && written >= 0 {
                        let synced = retry(|| libc::fdatasync(fd) as isize);
                        if synced < 0 {
                            return synced;
                        }
                    }
                    written
                }
                OpDescriptor::ReadVectored {
                    fd,
                    iovecs,
                    count,
                    offset,
                } => retry(|| libc::preadv(fd, iovecs, count as libc::c_int, offset as libc::off_t)),
                OpDescriptor::WriteVectored {
                    fd,
                    iovecs,
                    count,
                    offset,
                } => {
                    retry(|| libc::pwritev(fd, iovecs, count as libc::c_int, offset as libc::off_t))
                }
                OpDescriptor::Fsync { fd, datasync, .. } => retry(|| {
                    if datasync {
                        libc::fdatasync(fd) as isize
                    } else {
                        libc::fsync(fd) as isize
                    }
                }),
                OpDescriptor::OpenAt { path, flags, mode } => {
                    retry(|| libc::openat(libc::AT_FDCWD, path, flags, mode as libc::c_uint) as isize)
                }
                // close is never retried: the descriptor is gone even on EINTR.
                OpDescriptor::Close { fd } => {
                    if libc::close(fd) < 0 {
                        last_errno_result()
                    } else {
                        0
                    }
                }
                OpDescriptor::UnlinkAt { path, flags } => {
                    retry(|| libc::unlinkat(libc::AT_FDCWD, path, flags) as isize)
                }
                // Every operation finished before its push returned, so there
                // is never anything left to cancel.
                OpDescriptor::Cancel { .. } | OpDescriptor::CancelAll { .. } => -libc::ENOENT,
            }
        }
    }

    fn drain_wakeups(&self) {
        let mut counter = 0u64;
        // SAFETY: reads eight bytes into a local; the eventfd is non-blocking.
        unsafe {
            libc::read(
                self.wake_fd,
                (&mut counter as *mut u64).cast(),
                std::mem::size_of::<u64>(),
            );
        }
    }
}

/// Run `call` until it stops failing with EINTR; map failures to `-errno`.
fn retry(mut call: impl FnMut() -> isize) -> i32 {
    loop {
        let ret = call();
        if ret >= 0 {
            return ret.min(i32::MAX as isize) as i32;
        }
        let errno = last_errno_result();
        if errno != -libc::EINTR {
            return errno;
        }
    }
}

impl Backend for BlockingBackend {
    fn push(&mut self, user_data: u64, op: &OpDescriptor) -> Result<()> {
        let result = Self::execute(op);
        crate::log_trace!(
            "backend",
            "blocking {} -> {} (user_data {:#x})",
            op.kind(),
            result,
            user_data
        );
        self.ready.push_back((user_data, result));
        Ok(())
    }

    fn submit(&mut self) -> Result<usize> {
        Ok(0)
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<()> {
        if !self.ready.is_empty() {
            return Ok(());
        }

        let timeout_ms = match timeout {
            None => -1,
            Some(t) => {
                // Round up so a sub-millisecond timer does not spin.
                let ms = t.as_micros().div_ceil(1000);
                ms.min(i32::MAX as u128) as libc::c_int
            }
        };

        let mut pollfd = libc::pollfd {
            fd: self.wake_fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: one valid pollfd on the stack.
        let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err.into());
            }
        } else if ready > 0 {
            self.drain_wakeups();
        }
        Ok(())
    }

    fn drain(&mut self, out: &mut Vec<(u64, i32)>) {
        out.extend(self.ready.drain(..));
    }

    fn operations_in_flight(&self) -> usize {
        self.ready.len()
    }

    fn name(&self) -> &'static str {
        "blocking"
    }
}
