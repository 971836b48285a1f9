//! Error types for uring-file operations.
//!
//! Every failure a caller can observe travels through [`Error`]. Completion
//! futures hand the same failure to several consumers (a blocking joiner, an
//! async waker and a completion handler), so the error type is `Clone`; the
//! variants that wrap `std::io::Error` keep it behind an `Arc` for that reason.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::file::HandleState;
use crate::operation::OpKind;

/// Result type alias for uring-file operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for uring-file operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Every slot of a handle's operation registry is in use.
    ///
    /// This is backpressure, not a fault: the caller should retry once some
    /// in-flight operations have completed.
    #[error("operation registry is full ({capacity} operations in flight)")]
    RegistryFull {
        /// Configured registry capacity
        capacity: usize,
    },

    /// The handle is closing or closed and no longer accepts operations.
    #[error("file handle is closed")]
    HandleClosed,

    /// Data operations require an open handle.
    #[error("file handle is not open (state: {state})")]
    NotOpen {
        /// State the handle was in when the operation was attempted
        state: HandleState,
    },

    /// The kernel completed an operation with a negative result.
    #[error("{op} failed: {}", errno_message(.code))]
    Syscall {
        /// Operation that failed
        op: OpKind,
        /// Negated errno exactly as reported by the completion
        code: i32,
    },

    /// The reactor refused to accept a submission.
    #[error("submission rejected: {0}")]
    Submission(String),

    /// The reactor registration was cancelled or never established.
    #[error("reactor registration is no longer valid")]
    RegistrationInvalid,

    /// An operation exceeded the stuck-operation timeout.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Anonymous files have no name to unlink.
    #[error("cannot unlink an anonymous file")]
    AnonymousUnlink,

    /// Invalid argument supplied by the caller.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Buffer is still lent to the kernel and cannot be accessed.
    #[error("buffer still in flight")]
    BufferInFlight,

    /// A completion future was resolved a second time.
    #[error("completion future already resolved")]
    AlreadyCompleted,

    /// A completion future already carries a handler.
    #[error("completion handler already registered")]
    HandlerAlreadyRegistered,

    /// The owning event loop has stopped.
    #[error("event loop has shut down")]
    LoopShutdown,

    /// Standard I/O error, typically from ring or eventfd setup.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),
}

impl Error {
    /// Build a syscall error from a negative completion result.
    pub fn syscall(op: OpKind, code: i32) -> Self {
        Error::Syscall { op, code }
    }

    /// The errno carried by this error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Syscall { code, .. } => Some(-code),
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// Convert a syscall failure into the equivalent `std::io::Error`.
    pub fn io_error(&self) -> Option<io::Error> {
        match self {
            Error::Syscall { code, .. } => Some(io::Error::from_raw_os_error(-code)),
            _ => None,
        }
    }

    /// True when the failure is registry backpressure and a retry may succeed.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Error::RegistryFull { .. })
    }

    /// True when the kernel reports the operation as cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.raw_os_error(), Some(libc::ECANCELED) | Some(libc::EINTR))
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(Arc::new(error))
    }
}

fn errno_message(code: &i32) -> String {
    let err = io::Error::from_raw_os_error(-*code);
    format!("{} (errno {})", err, -*code)
}

/// Report an internal invariant violation and abort the current thread.
///
/// Used for conditions that mean the handle's bookkeeping is corrupt, such as a
/// completion future being resolved twice. Continuing would risk releasing a
/// buffer the kernel still writes into.
#[cold]
pub fn fatal(component: &str, message: &str) -> ! {
    crate::log_error!(component, "fatal: {}", message);
    panic!("{}: {}", component, message);
}

static_assertions::assert_impl_all!(Error: Send, Sync, Clone);

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    mod error_messages {
        use super::*;

        #[test]
        fn registry_full() {
            let error = Error::RegistryFull { capacity: 4 };
            assert_eq!(
                error.to_string(),
                "operation registry is full (4 operations in flight)"
            );
        }

        #[test]
        fn not_open_names_state() {
            let error = Error::NotOpen {
                state: HandleState::Opening,
            };
            assert_eq!(error.to_string(), "file handle is not open (state: opening)");
        }

        #[test]
        fn syscall_names_operation_and_errno() {
            let error = Error::syscall(OpKind::Read, -libc::EBADF);
            let text = error.to_string();
            assert!(text.starts_with("read failed:"));
            assert!(text.contains(&format!("errno {}", libc::EBADF)));
        }
    }

    mod error_conversion {
        use super::*;

        #[test]
        fn io_error_conversion() {
            let error = Error::from(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
            let Error::Io(ref e) = error else {
                panic!("Expected Io error variant");
            };
            assert_eq!(e.kind(), io::ErrorKind::PermissionDenied);
            assert!(error.source().is_some());
        }

        #[test]
        fn syscall_maps_to_io_error() {
            let error = Error::syscall(OpKind::OpenAt, -libc::ENOENT);
            assert_eq!(error.raw_os_error(), Some(libc::ENOENT));
            assert_eq!(
                error.io_error().map(|e| e.kind()),
                Some(io::ErrorKind::NotFound)
            );
        }

        #[test]
        fn cancellation_codes() {
            assert!(Error::syscall(OpKind::Read, -libc::ECANCELED).is_cancelled());
            assert!(!Error::syscall(OpKind::Read, -libc::EIO).is_cancelled());
            assert!(Error::RegistryFull { capacity: 1 }.is_backpressure());
        }
    }

    #[test]
    fn clones_share_io_source() {
        let error = Error::from(io::Error::other("boom"));
        let copy = error.clone();
        match (error, copy) {
            (Error::Io(a), Error::Io(b)) => assert!(Arc::ptr_eq(&a, &b)),
            _ => panic!("Expected Io error variants"),
        }
    }
}
