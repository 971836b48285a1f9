//! Completion backends driven by the event loop.
//!
//! A backend accepts [`OpDescriptor`]s tagged with 64-bit user data and later
//! reports `(user_data, result)` pairs with kernel result semantics: a
//! non-negative value on success, a negated errno on failure.
//!
//! - [`IoUringBackend`](self::io_uring::IoUringBackend): submits to an io_uring
//!   instance and blocks in `io_uring_enter`
//! - [`BlockingBackend`](self::blocking::BlockingBackend): executes each
//!   descriptor synchronously with the equivalent syscall, for kernels or
//!   sandboxes where io_uring is unavailable
//!
//! Both honour the event loop's wakeup eventfd so that work posted from other
//! threads interrupts a wait.

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::config::{DriverKind, RingConfig};
use crate::error::Result;
use crate::operation::OpDescriptor;

pub mod blocking;
pub mod io_uring;

/// Trait for completion backends.
///
/// Backends are owned by the event loop thread and are not shared.
///
/// # Safety contract
///
/// Descriptors pushed to a backend carry raw pointers. The pusher keeps every
/// pointed-to buffer, iovec array and path alive until the completion for that
/// user data has been drained.
pub trait Backend {
    /// Queue one operation.
    ///
    /// The blocking backend executes it right away; its completion is still
    /// only reported by [`drain`](Self::drain).
    fn push(&mut self, user_data: u64, op: &OpDescriptor) -> Result<()>;

    /// Hand queued operations to the kernel without waiting.
    fn submit(&mut self) -> Result<usize>;

    /// Block until a completion is ready, the wakeup eventfd fires, or
    /// `timeout` elapses. `None` waits indefinitely.
    fn wait(&mut self, timeout: Option<Duration>) -> Result<()>;

    /// Move every ready completion into `out`.
    fn drain(&mut self, out: &mut Vec<(u64, i32)>);

    /// Operations pushed whose completion has not been drained yet.
    fn operations_in_flight(&self) -> usize;

    /// Backend name for logging.
    fn name(&self) -> &'static str;
}

/// Create the backend selected by `config`.
///
/// With [`DriverKind::Auto`], a failure to set up io_uring (old kernel,
/// seccomp filter, missing opcodes) falls back to the blocking backend.
/// [`DriverKind::IoUring`] reports that failure instead.
pub fn detect_backend(config: &RingConfig, wake_fd: RawFd) -> Result<Box<dyn Backend>> {
    match config.driver {
        DriverKind::IoUring => Ok(Box::new(io_uring::IoUringBackend::new(
            config.sq_entries,
            wake_fd,
        )?)),
        DriverKind::Blocking => Ok(Box::new(blocking::BlockingBackend::new(wake_fd))),
        DriverKind::Auto => match io_uring::IoUringBackend::new(config.sq_entries, wake_fd) {
            Ok(backend) => Ok(Box::new(backend)),
            Err(e) => {
                crate::log_warn!(
                    "backend",
                    "io_uring unavailable ({}), using blocking syscalls",
                    e
                );
                Ok(Box::new(blocking::BlockingBackend::new(wake_fd)))
            }
        },
    }
}

/// Errno of the last failed libc call as a negative kernel-style result.
pub(crate) fn last_errno_result() -> i32 {
    -std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}
