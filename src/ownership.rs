//! Buffer ownership for operations the kernel reads from or writes into.
//!
//! While an operation is in flight the kernel holds a raw pointer into the
//! caller's buffer. [`OwnedBuffer`] makes that hand-off explicit: lending the
//! buffer moves it to [`BufferOwnership::Kernel`], and it only becomes
//! accessible again when the [`KernelLease`] for that operation is dropped,
//! which happens exactly once, after the completion has been processed.
//!
//! Buffers carry a reader index and a writer index. Reads fill the region
//! between the writer index and the capacity and advance the writer index;
//! writes drain the region between the reader and writer indices and advance
//! the reader index.
//!
//! ```rust
//! use uring_file::OwnedBuffer;
//!
//! let buffer = OwnedBuffer::new(16);
//! buffer.write_bytes(b"hello").unwrap();
//! assert_eq!(buffer.readable_bytes(), 5);
//! assert_eq!(buffer.readable().unwrap(), b"hello");
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};

/// Who may touch the buffer memory right now.
#[derive(Debug)]
pub enum BufferOwnership {
    /// Owned by userspace and safe to access.
    User(Box<[u8]>),
    /// Lent to the kernel for an in-flight operation.
    Kernel(Box<[u8]>),
    /// Temporarily moved into a [`BufferAccessGuard`].
    Returning,
}

/// Which index an operation moves when it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The kernel fills the writable region; advances the writer index.
    Fill,
    /// The kernel drains the readable region; advances the reader index.
    Drain,
}

#[derive(Debug)]
struct BufferState {
    ownership: BufferOwnership,
    reader_index: usize,
    writer_index: usize,
}

/// A byte buffer that can be lent to the kernel for one operation at a time.
///
/// Handles obtained through [`clone_handle`](Self::clone_handle) share the
/// same memory, indices and ownership state.
#[derive(Debug)]
pub struct OwnedBuffer {
    inner: Arc<Mutex<BufferState>>,
    capacity: usize,
}

impl OwnedBuffer {
    /// Create a zeroed buffer with nothing readable.
    pub fn new(capacity: usize) -> Self {
        Self::from_parts(vec![0u8; capacity].into_boxed_slice(), 0)
    }

    /// Create a buffer whose readable region is a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        Self::from_parts(data.to_vec().into_boxed_slice(), data.len())
    }

    fn from_parts(buffer: Box<[u8]>, writer_index: usize) -> Self {
        let capacity = buffer.len();
        Self {
            inner: Arc::new(Mutex::new(BufferState {
                ownership: BufferOwnership::User(buffer),
                reader_index: 0,
                writer_index,
            })),
            capacity,
        }
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        lock(&self.inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn reader_index(&self) -> usize {
        self.state().reader_index
    }

    pub fn writer_index(&self) -> usize {
        self.state().writer_index
    }

    /// Bytes between the reader and writer indices.
    pub fn readable_bytes(&self) -> usize {
        let state = self.state();
        state.writer_index - state.reader_index
    }

    /// Bytes between the writer index and the capacity.
    pub fn writable_bytes(&self) -> usize {
        self.capacity - self.state().writer_index
    }

    pub fn is_user_owned(&self) -> bool {
        matches!(self.state().ownership, BufferOwnership::User(_))
    }

    /// True while an operation holds the buffer.
    pub fn is_lent(&self) -> bool {
        matches!(self.state().ownership, BufferOwnership::Kernel(_))
    }

    /// Exclusive access to the whole buffer, ignoring the indices.
    ///
    /// Returns `None` while the buffer is lent or already being accessed.
    pub fn try_access(&self) -> Option<BufferAccessGuard> {
        let mut state = self.state();
        match std::mem::replace(&mut state.ownership, BufferOwnership::Returning) {
            BufferOwnership::User(buffer) => Some(BufferAccessGuard {
                buffer,
                owner: Arc::clone(&self.inner),
            }),
            other => {
                state.ownership = other;
                None
            }
        }
    }

    /// Copy of the readable region.
    pub fn readable(&self) -> Result<Vec<u8>> {
        let state = self.state();
        match &state.ownership {
            BufferOwnership::User(buffer) => {
                Ok(buffer[state.reader_index..state.writer_index].to_vec())
            }
            _ => Err(Error::BufferInFlight),
        }
    }

    /// Append as much of `data` as fits into the writable region.
    ///
    /// Returns the number of bytes copied.
    pub fn write_bytes(&self, data: &[u8]) -> Result<usize> {
        let mut state = self.state();
        let start = state.writer_index;
        let BufferOwnership::User(buffer) = &mut state.ownership else {
            return Err(Error::BufferInFlight);
        };
        let n = data.len().min(buffer.len() - start);
        buffer[start..start + n].copy_from_slice(&data[..n]);
        state.writer_index += n;
        Ok(n)
    }

    /// Reset both indices to zero.
    pub fn clear(&self) -> Result<()> {
        self.set_indices(0, 0)
    }

    /// Move the indices; requires `reader <= writer <= capacity`.
    pub fn set_indices(&self, reader_index: usize, writer_index: usize) -> Result<()> {
        if reader_index > writer_index || writer_index > self.capacity {
            return Err(Error::InvalidInput(format!(
                "indices {}..{} outside buffer of {} bytes",
                reader_index, writer_index, self.capacity
            )));
        }
        let mut state = self.state();
        if !matches!(state.ownership, BufferOwnership::User(_)) {
            return Err(Error::BufferInFlight);
        }
        state.reader_index = reader_index;
        state.writer_index = writer_index;
        Ok(())
    }

    /// Another handle to the same buffer.
    pub fn clone_handle(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            capacity: self.capacity,
        }
    }

    /// Lend the region `direction` works on to the kernel.
    ///
    /// Fails with [`Error::BufferInFlight`] unless the buffer is user-owned.
    pub(crate) fn lend(&self, direction: Direction) -> Result<KernelLease> {
        let mut state = self.state();
        let (reader, writer) = (state.reader_index, state.writer_index);
        let buffer = match std::mem::replace(&mut state.ownership, BufferOwnership::Returning) {
            BufferOwnership::User(buffer) => buffer,
            other => {
                state.ownership = other;
                return Err(Error::BufferInFlight);
            }
        };

        let (start, len) = match direction {
            Direction::Fill => (writer, buffer.len() - writer),
            Direction::Drain => (reader, writer - reader),
        };
        // The boxed slice never moves while lent; only the Box itself does.
        let addr = buffer.as_ptr() as usize + start;
        state.ownership = BufferOwnership::Kernel(buffer);

        Ok(KernelLease {
            owner: Arc::clone(&self.inner),
            direction,
            addr,
            len,
        })
    }
}

fn lock(inner: &Mutex<BufferState>) -> MutexGuard<'_, BufferState> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The kernel's claim on one buffer for one operation.
///
/// Dropping the lease returns the buffer to userspace. The lease is moved into
/// the operation's completion handler, so it is dropped exactly once, after
/// the kernel is done with the memory.
#[derive(Debug)]
pub(crate) struct KernelLease {
    owner: Arc<Mutex<BufferState>>,
    direction: Direction,
    addr: usize,
    len: usize,
}

impl KernelLease {
    /// Start address of the lent region.
    pub(crate) fn addr(&self) -> usize {
        self.addr
    }

    /// Length of the lent region in bytes.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Record that the kernel transferred `n` bytes, clamped to the region.
    ///
    /// Returns the number of bytes actually applied.
    pub(crate) fn advance(&self, n: usize) -> usize {
        let n = n.min(self.len);
        let mut state = lock(&self.owner);
        match self.direction {
            Direction::Fill => state.writer_index += n,
            Direction::Drain => state.reader_index += n,
        }
        n
    }
}

impl Drop for KernelLease {
    fn drop(&mut self) {
        let mut state = lock(&self.owner);
        if let BufferOwnership::Kernel(buffer) =
            std::mem::replace(&mut state.ownership, BufferOwnership::Returning)
        {
            state.ownership = BufferOwnership::User(buffer);
        }
    }
}

/// RAII guard for direct buffer access.
pub struct BufferAccessGuard {
    buffer: Box<[u8]>,
    owner: Arc<Mutex<BufferState>>,
}

impl Drop for BufferAccessGuard {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        lock(&self.owner).ownership = BufferOwnership::User(buffer);
    }
}

impl Deref for BufferAccessGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buffer
    }
}

impl DerefMut for BufferAccessGuard {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_buffer_creation() {
        let buffer = OwnedBuffer::new(1024);
        assert_eq!(buffer.capacity(), 1024);
        assert!(buffer.is_user_owned());
        assert_eq!(buffer.readable_bytes(), 0);
        assert_eq!(buffer.writable_bytes(), 1024);
    }

    #[test]
    fn test_buffer_access_guard() {
        let buffer = OwnedBuffer::new(8);
        {
            let mut guard = buffer.try_access().unwrap();
            assert_eq!(guard.len(), 8);
            guard[0] = 42;
            assert!(buffer.try_access().is_none());
        }
        assert_eq!(buffer.try_access().unwrap()[0], 42);
    }

    #[test]
    fn test_fill_lease_covers_writable_region() {
        let buffer = OwnedBuffer::new(64);
        buffer.write_bytes(&[1; 10]).unwrap();

        let lease = buffer.lend(Direction::Fill).unwrap();
        assert_eq!(lease.len(), 54);
        assert!(buffer.is_lent());
        assert!(buffer.try_access().is_none());
        assert!(matches!(buffer.lend(Direction::Fill), Err(Error::BufferInFlight)));
        assert!(matches!(buffer.write_bytes(b"x"), Err(Error::BufferInFlight)));

        assert_eq!(lease.advance(100), 54);
        drop(lease);

        assert!(buffer.is_user_owned());
        assert_eq!(buffer.writer_index(), 64);
    }

    #[test]
    fn test_drain_lease_advances_reader() {
        let buffer = OwnedBuffer::from_slice(b"0123456789");
        let lease = buffer.lend(Direction::Drain).unwrap();
        assert_eq!(lease.len(), 10);

        lease.advance(4);
        drop(lease);

        assert_eq!(buffer.reader_index(), 4);
        assert_eq!(buffer.readable().unwrap(), b"456789");
    }

    #[test]
    fn test_lease_address_tracks_indices() {
        let buffer = OwnedBuffer::from_slice(b"abcdef");
        buffer.set_indices(2, 4).unwrap();

        let base = buffer.try_access().unwrap().as_ptr() as usize;
        let drain = buffer.lend(Direction::Drain).unwrap();
        assert_eq!(drain.addr(), base + 2);
        assert_eq!(drain.len(), 2);
        drop(drain);

        let fill = buffer.lend(Direction::Fill).unwrap();
        assert_eq!(fill.addr(), base + 4);
        assert_eq!(fill.len(), 2);
    }

    #[test]
    fn test_set_indices_validation() {
        let buffer = OwnedBuffer::new(4);
        assert!(buffer.set_indices(3, 2).is_err());
        assert!(buffer.set_indices(0, 5).is_err());
        assert!(buffer.set_indices(1, 4).is_ok());
        buffer.clear().unwrap();
        assert_eq!(buffer.readable_bytes(), 0);
    }

    #[test]
    fn test_clone_handle_shares_state() {
        let buffer = OwnedBuffer::new(16);
        let other = buffer.clone_handle();

        let lease = buffer.lend(Direction::Fill).unwrap();
        assert!(other.is_lent());
        lease.advance(3);
        drop(lease);
        assert_eq!(other.writer_index(), 3);
    }
}
