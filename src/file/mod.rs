//! Files driven through the event loop.
//!
//! [`File`] is the public surface. Every operation returns a
//! [`CompletionFuture`] and can be issued from any thread; the work itself
//! runs on the event loop that opened the file.
//!
//! Buffers are lent, not copied. While an operation is in flight its
//! [`OwnedBuffer`]s are owned by the kernel and refuse access; they are handed
//! back, with their indices advanced by the transferred byte count, just
//! before the operation's future resolves.
//!
//! # Example
//!
//! ```no_run
//! use uring_file::{EventLoop, File, OpenOptions, OwnedBuffer};
//!
//! # fn main() -> uring_file::Result<()> {
//! let event_loop = EventLoop::new()?;
//! let mut options = OpenOptions::new();
//! options.read(true).write(true).create(true);
//!
//! let file = File::open(&event_loop.handle(), "/tmp/data.bin", &options).join()?;
//! let buffer = OwnedBuffer::from_slice(b"hello");
//! let written = file.write(&buffer, 0, false).join()?;
//! assert_eq!(written, 5);
//! file.close().join()?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;

use crate::error::{fatal, Error, Result};
use crate::future::CompletionFuture;
use crate::open_options::{OpenOptions, OpenTarget};
use crate::operation::{OpDescriptor, OpKind};
use crate::ownership::{Direction, KernelLease, OwnedBuffer};
use crate::reactor::{EventLoopHandle, Reactor};

mod handle;
mod progress;

pub use handle::HandleState;
pub(crate) use handle::{FileHandle, HandleSettings};

/// Most buffers a single vectored operation accepts.
pub const MAX_IOVECS: usize = 1024;

/// An open file on an event loop.
///
/// Clones share the same handle. A file that is never closed stays
/// registered with its loop until the loop shuts down.
#[derive(Clone)]
pub struct File {
    handle: Arc<FileHandle>,
}

impl File {
    /// Open `path` on `event_loop`.
    ///
    /// The future resolves once the kernel has opened the file. Opening a
    /// directory fails with [`Error::InvalidInput`].
    pub fn open(
        event_loop: &EventLoopHandle,
        path: impl AsRef<Path>,
        options: &OpenOptions,
    ) -> CompletionFuture<File> {
        match OpenTarget::named(path.as_ref(), options) {
            Ok(target) => Self::open_target(
                Arc::new(event_loop.clone()),
                HandleSettings::from_config(event_loop.config()),
                target,
            ),
            Err(e) => CompletionFuture::failed(OpKind::OpenAt, e),
        }
    }

    /// Open an unnamed temporary file (`O_TMPFILE`) in the system temp
    /// directory. It disappears when closed and cannot be unlinked.
    pub fn open_anonymous(
        event_loop: &EventLoopHandle,
        options: &OpenOptions,
    ) -> CompletionFuture<File> {
        match OpenTarget::anonymous(options) {
            Ok(target) => Self::open_target(
                Arc::new(event_loop.clone()),
                HandleSettings::from_config(event_loop.config()),
                target,
            ),
            Err(e) => CompletionFuture::failed(OpKind::OpenAt, e),
        }
    }

    pub(crate) fn open_target(
        reactor: Arc<dyn Reactor>,
        settings: HandleSettings,
        target: OpenTarget,
    ) -> CompletionFuture<File> {
        let handle = match FileHandle::new(reactor, settings, target) {
            Ok(handle) => handle,
            Err(e) => return CompletionFuture::failed(OpKind::OpenAt, e),
        };

        let opened = CompletionFuture::with_op(OpKind::OpenAt);
        let done = opened.clone();
        let file = File {
            handle: Arc::clone(&handle),
        };
        let attached = handle.open().on_complete(move |outcome| match outcome {
            Ok(_) => done.resolve_or_fatal("file", Ok(file)),
            Err(e) => {
                // Nobody will ever hold this file; unregister it.
                let _ = file.handle.close();
                done.resolve_or_fatal("file", Err(e));
            }
        });
        if let Err(e) = attached {
            return CompletionFuture::failed(OpKind::OpenAt, e);
        }
        opened
    }

    /// Read into `buffer`'s writable region from `offset`.
    ///
    /// Resolves with the byte count; the buffer's writer index advances by it.
    pub fn read(&self, buffer: &OwnedBuffer, offset: u64) -> CompletionFuture {
        let lease = match lend(buffer, Direction::Fill) {
            Ok(lease) => lease,
            Err(e) => return CompletionFuture::failed(OpKind::Read, e),
        };
        let (addr, len) = (lease.addr(), region_len(&lease));
        let submitted = self.handle.submit(OpKind::Read, move |fd| OpDescriptor::Read {
            fd,
            buf: addr as *mut u8,
            len,
            offset,
        });
        settle(OpKind::Read, submitted, move |n| {
            lease.advance(n);
        })
    }

    /// Write `buffer`'s readable region at `offset`.
    ///
    /// With `dsync` the write completes only once the data is durable
    /// (`RWF_DSYNC`). Resolves with the byte count; the buffer's reader index
    /// advances by it.
    pub fn write(&self, buffer: &OwnedBuffer, offset: u64, dsync: bool) -> CompletionFuture {
        let lease = match lend(buffer, Direction::Drain) {
            Ok(lease) => lease,
            Err(e) => return CompletionFuture::failed(OpKind::Write, e),
        };
        let (addr, len) = (lease.addr(), region_len(&lease));
        let submitted = self.handle.submit(OpKind::Write, move |fd| OpDescriptor::Write {
            fd,
            buf: addr as *const u8,
            len,
            offset,
            dsync,
        });
        settle(OpKind::Write, submitted, move |n| {
            lease.advance(n);
        })
    }

    /// Scatter-read into `buffers` in order from `offset`.
    ///
    /// A short read fills the buffers front to back.
    pub fn read_vectored(&self, buffers: &[OwnedBuffer], offset: u64) -> CompletionFuture {
        self.vectored(OpKind::ReadVectored, buffers, offset)
    }

    /// Gather-write `buffers` in order at `offset`.
    pub fn write_vectored(&self, buffers: &[OwnedBuffer], offset: u64) -> CompletionFuture {
        self.vectored(OpKind::WriteVectored, buffers, offset)
    }

    fn vectored(&self, op: OpKind, buffers: &[OwnedBuffer], offset: u64) -> CompletionFuture {
        let direction = if op == OpKind::ReadVectored {
            Direction::Fill
        } else {
            Direction::Drain
        };
        let leases = match lend_all(buffers, direction) {
            Ok(leases) => leases,
            Err(e) => return CompletionFuture::failed(op, e),
        };
        let iovecs = IovecArray::new(&leases);
        let (addr, count) = (iovecs.0.as_ptr() as usize, iovecs.0.len() as u32);

        let submitted = self.handle.submit(op, move |fd| {
            let iovecs = addr as *const libc::iovec;
            if op == OpKind::ReadVectored {
                OpDescriptor::ReadVectored {
                    fd,
                    iovecs,
                    count,
                    offset,
                }
            } else {
                OpDescriptor::WriteVectored {
                    fd,
                    iovecs,
                    count,
                    offset,
                }
            }
        });
        settle(op, submitted, move |n| {
            let lens: Vec<usize> = leases.iter().map(KernelLease::len).collect();
            for (lease, part) in leases.iter().zip(progress::distribute(&lens, n)) {
                lease.advance(part);
            }
            drop(iovecs);
        })
    }

    /// Flush the file to stable storage; `datasync` skips metadata not needed
    /// to read the data back.
    ///
    /// `len` and `offset` describe the range the caller cares about; the
    /// whole file is synced.
    pub fn fsync(&self, datasync: bool, len: u32, offset: u64) -> CompletionFuture {
        self.handle.submit(OpKind::Fsync, move |fd| OpDescriptor::Fsync {
            fd,
            datasync,
            len,
            offset,
        })
    }

    /// Remove the file's name.
    ///
    /// Operations already in flight are not waited for and keep working on
    /// the open descriptor. Fails with [`Error::AnonymousUnlink`] for
    /// anonymous files.
    pub fn unlink(&self) -> CompletionFuture {
        self.handle.unlink()
    }

    /// Close the file once every in-flight operation has drained.
    ///
    /// Outstanding operations are cancelled first. Every call, from any
    /// clone, returns the same future and the descriptor is closed once.
    pub fn close(&self) -> CompletionFuture {
        self.handle.close()
    }

    /// Path the file was opened with; the temp directory for anonymous files.
    pub fn path(&self) -> &Path {
        self.handle.path()
    }

    pub fn is_anonymous(&self) -> bool {
        self.handle.is_anonymous()
    }

    /// Operations currently in flight, as seen from the event loop.
    pub fn in_flight(&self) -> CompletionFuture<usize> {
        self.handle.in_flight()
    }

    /// Current lifecycle state, as seen from the event loop.
    pub fn state(&self) -> CompletionFuture<HandleState> {
        self.handle.state()
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File").field("handle", &self.handle).finish()
    }
}

/// Lend `buffer`, refusing an empty region.
fn lend(buffer: &OwnedBuffer, direction: Direction) -> Result<KernelLease> {
    let lease = buffer.lend(direction)?;
    if lease.len() == 0 {
        return Err(Error::InvalidInput(match direction {
            Direction::Fill => "buffer has no writable space".to_string(),
            Direction::Drain => "buffer has no readable bytes".to_string(),
        }));
    }
    Ok(lease)
}

fn lend_all(buffers: &[OwnedBuffer], direction: Direction) -> Result<Vec<KernelLease>> {
    if buffers.is_empty() || buffers.len() > MAX_IOVECS {
        return Err(Error::InvalidInput(format!(
            "vectored operations take 1..={} buffers, got {}",
            MAX_IOVECS,
            buffers.len()
        )));
    }
    buffers
        .iter()
        .map(|buffer| lend(buffer, direction))
        .collect()
}

fn region_len(lease: &KernelLease) -> u32 {
    u32::try_from(lease.len()).unwrap_or(u32::MAX)
}

/// iovec array handed to the kernel for one vectored operation.
struct IovecArray(Box<[libc::iovec]>);

// SAFETY: the entries point into buffers lent for the same operation. The
// array is moved into that operation's completion handler and never read
// from userspace.
unsafe impl Send for IovecArray {}

impl IovecArray {
    fn new(leases: &[KernelLease]) -> Self {
        Self(
            leases
                .iter()
                .map(|lease| libc::iovec {
                    iov_base: lease.addr() as *mut libc::c_void,
                    iov_len: lease.len(),
                })
                .collect(),
        )
    }
}

/// Resolve the caller's future from the operation's, returning lent buffers
/// first.
///
/// `on_success` receives the transferred byte count. On failure it is dropped
/// unrun, which drops any leases it owns.
fn settle<F>(op: OpKind, submitted: CompletionFuture, on_success: F) -> CompletionFuture
where
    F: FnOnce(usize) + Send + 'static,
{
    let result = CompletionFuture::with_op(op);
    let done = result.clone();
    let attached = submitted.on_complete(move |outcome| {
        match &outcome {
            Ok(n) => on_success(*n as usize),
            Err(_) => drop(on_success),
        }
        done.resolve_or_fatal("file", outcome);
    });
    if attached.is_err() {
        fatal("file", &format!("{} completion already had a handler", op));
    }
    result
}
