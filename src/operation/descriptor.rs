//! Submission descriptors handed from a file handle to its reactor.

use std::os::unix::io::RawFd;

use super::OpKind;

/// A fully described kernel operation, ready to be queued.
///
/// Descriptors carry raw pointers into caller buffers, iovec arrays and path
/// strings. They are built on the event loop thread immediately before
/// submission, and whoever built one keeps the pointed-to memory alive until
/// the matching completion has been dispatched.
#[derive(Debug, Clone, Copy)]
pub enum OpDescriptor {
    Read {
        fd: RawFd,
        buf: *mut u8,
        len: u32,
        offset: u64,
    },
    Write {
        fd: RawFd,
        buf: *const u8,
        len: u32,
        offset: u64,
        /// Per-write data sync (RWF_DSYNC)
        dsync: bool,
    },
    ReadVectored {
        fd: RawFd,
        iovecs: *const libc::iovec,
        count: u32,
        offset: u64,
    },
    WriteVectored {
        fd: RawFd,
        iovecs: *const libc::iovec,
        count: u32,
        offset: u64,
    },
    Fsync {
        fd: RawFd,
        datasync: bool,
        len: u32,
        offset: u64,
    },
    /// Relative paths resolve against the current working directory.
    OpenAt {
        path: *const libc::c_char,
        flags: i32,
        mode: u32,
    },
    Close {
        fd: RawFd,
    },
    UnlinkAt {
        path: *const libc::c_char,
        flags: i32,
    },
    /// Cancel the operation submitted with this user data.
    Cancel {
        target: u64,
    },
    /// Cancel every operation in flight on `fd`.
    CancelAll {
        fd: RawFd,
    },
}

impl OpDescriptor {
    pub fn kind(&self) -> OpKind {
        match self {
            Self::Read { .. } => OpKind::Read,
            Self::Write { .. } => OpKind::Write,
            Self::ReadVectored { .. } => OpKind::ReadVectored,
            Self::WriteVectored { .. } => OpKind::WriteVectored,
            Self::Fsync { .. } => OpKind::Fsync,
            Self::OpenAt { .. } => OpKind::OpenAt,
            Self::Close { .. } => OpKind::Close,
            Self::UnlinkAt { .. } => OpKind::UnlinkAt,
            Self::Cancel { .. } | Self::CancelAll { .. } => OpKind::AsyncCancel,
        }
    }

    /// Descriptor this operation targets, if it has one.
    pub fn fd(&self) -> Option<RawFd> {
        match *self {
            Self::Read { fd, .. }
            | Self::Write { fd, .. }
            | Self::ReadVectored { fd, .. }
            | Self::WriteVectored { fd, .. }
            | Self::Fsync { fd, .. }
            | Self::Close { fd }
            | Self::CancelAll { fd } => Some(fd),
            Self::OpenAt { .. } | Self::UnlinkAt { .. } | Self::Cancel { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_variants_share_a_kind() {
        assert_eq!(OpDescriptor::Cancel { target: 7 }.kind(), OpKind::AsyncCancel);
        assert_eq!(OpDescriptor::CancelAll { fd: 3 }.kind(), OpKind::AsyncCancel);
        assert_eq!(OpDescriptor::CancelAll { fd: 3 }.fd(), Some(3));
        assert_eq!(OpDescriptor::Cancel { target: 7 }.fd(), None);
    }
}
