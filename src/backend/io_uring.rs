//! io_uring backend implementation.

use std::os::unix::io::RawFd;
use std::time::Duration;

use ::io_uring::{opcode, squeue, types, IoUring, Probe};

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::operation::wire::WAKE_USER_DATA;
use crate::operation::OpDescriptor;

/// User data of the timeout entry used when the kernel lacks
/// `IORING_FEAT_EXT_ARG`. Like the wakeup read, its token half is `u32::MAX`,
/// which no route ever receives.
const TIMEOUT_USER_DATA: u64 = u64::MAX - 1;

/// Opcodes a file handle may submit. Cancel-all shares `AsyncCancel`'s
/// opcode, so its descriptor flags cannot be probed here.
const REQUIRED_OPCODES: [u8; 10] = [
    opcode::Read::CODE,
    opcode::Write::CODE,
    opcode::Readv::CODE,
    opcode::Writev::CODE,
    opcode::Fsync::CODE,
    opcode::OpenAt::CODE,
    opcode::Close::CODE,
    opcode::UnlinkAt::CODE,
    opcode::AsyncCancel::CODE,
    opcode::Timeout::CODE,
];

/// io_uring-based backend.
pub struct IoUringBackend {
    ring: IoUring,
    in_flight: usize,
    wake_fd: RawFd,
    wake_buf: Box<[u8; 8]>,
    timeout_spec: Box<types::Timespec>,
    ext_arg: bool,
}

impl IoUringBackend {
    /// Create a ring with `entries` submission slots and arm the wakeup read.
    pub fn new(entries: u32, wake_fd: RawFd) -> Result<Self> {
        let ring = IoUring::new(entries)?;

        let mut probe = Probe::new();
        ring.submitter().register_probe(&mut probe)?;
        if let Some(missing) = REQUIRED_OPCODES
            .iter()
            .find(|&&code| !probe.is_supported(code))
        {
            return Err(Error::Io(std::sync::Arc::new(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("kernel lacks io_uring opcode {}", missing),
            ))));
        }

        let ext_arg = ring.params().is_feature_ext_arg();
        let mut backend = Self {
            ring,
            in_flight: 0,
            wake_fd,
            wake_buf: Box::new([0u8; 8]),
            timeout_spec: Box::new(types::Timespec::new()),
            ext_arg,
        };
        backend.arm_wake()?;
        backend.ring.submit()?;

        crate::log_debug!(
            "backend",
            "io_uring ready: {} entries, ext_arg={}",
            entries,
            ext_arg
        );
        Ok(backend)
    }

    fn arm_wake(&mut self) -> Result<()> {
        let entry = opcode::Read::new(types::Fd(self.wake_fd), self.wake_buf.as_mut_ptr(), 8)
            .build()
            .user_data(WAKE_USER_DATA);
        self.push_entry(&entry)
    }

    /// Push one entry, flushing the queue once if it is full.
    fn push_entry(&mut self, entry: &squeue::Entry) -> Result<()> {
        // SAFETY: every pointer inside `entry` is kept alive by whoever built
        // the descriptor until its completion has been drained; the wakeup and
        // timeout buffers live as long as the ring.
        if unsafe { self.ring.submission().push(entry) }.is_ok() {
            return Ok(());
        }
        self.ring.submit()?;
        unsafe { self.ring.submission().push(entry) }
            .map_err(|_| Error::Submission("submission queue full".to_string()))
    }

    fn entry(op: &OpDescriptor) -> squeue::Entry {
        match *op {
            OpDescriptor::Read {
                fd,
                buf,
                len,
                offset,
            } => opcode::Read::new(types::Fd(fd), buf, len)
                .offset(offset)
                .build(),
            OpDescriptor::Write {
                fd,
                buf,
                len,
                offset,
                dsync,
            } => {
                let write = opcode::Write::new(types::Fd(fd), buf, len).offset(offset);
                if dsync {
                    write.rw_flags(libc::RWF_DSYNC as _).build()
                } else {
                    write.build()
                }
            }
            OpDescriptor::ReadVectored {
                fd,
                iovecs,
                count,
                offset,
            } => opcode::Readv::new(types::Fd(fd), iovecs, count)
                .offset(offset)
                .build(),
            OpDescriptor::WriteVectored {
                fd,
                iovecs,
                count,
                offset,
            } => opcode::Writev::new(types::Fd(fd), iovecs, count)
                .offset(offset)
                .build(),
            // Range hints are not forwarded: IORING_OP_FSYNC ignores them
            // unless the kernel supports ranged sync, and a full sync is
            // always correct.
            OpDescriptor::Fsync { fd, datasync, .. } => {
                let fsync = opcode::Fsync::new(types::Fd(fd));
                if datasync {
                    fsync.flags(types::FsyncFlags::DATASYNC).build()
                } else {
                    fsync.build()
                }
            }
            OpDescriptor::OpenAt { path, flags, mode } => {
                opcode::OpenAt::new(types::Fd(libc::AT_FDCWD), path)
                    .flags(flags)
                    .mode(mode)
                    .build()
            }
            OpDescriptor::Close { fd } => opcode::Close::new(types::Fd(fd)).build(),
            OpDescriptor::UnlinkAt { path, flags } => {
                opcode::UnlinkAt::new(types::Fd(libc::AT_FDCWD), path)
                    .flags(flags)
                    .build()
            }
            OpDescriptor::Cancel { target } => opcode::AsyncCancel::new(target).build(),
            // IORING_ASYNC_CANCEL_FD | ALL arrived in 5.19. Older kernels
            // answer -EINVAL and the handle cancels slot by slot instead.
            OpDescriptor::CancelAll { fd } => {
                opcode::AsyncCancel2::new(types::CancelBuilder::fd(types::Fd(fd)).all()).build()
            }
        }
    }
}

impl Backend for IoUringBackend {
    fn push(&mut self, user_data: u64, op: &OpDescriptor) -> Result<()> {
        let entry = Self::entry(op).user_data(user_data);
        self.push_entry(&entry)?;
        self.in_flight += 1;
        Ok(())
    }

    fn submit(&mut self) -> Result<usize> {
        Ok(self.ring.submit()?)
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<()> {
        if !self.ring.completion().is_empty() {
            self.ring.submit()?;
            return Ok(());
        }

        let result = match timeout {
            None => self.ring.submit_and_wait(1),
            Some(timeout) if self.ext_arg => {
                let ts = types::Timespec::from(timeout);
                let args = types::SubmitArgs::new().timespec(&ts);
                self.ring.submitter().submit_with_args(1, &args)
            }
            Some(timeout) => {
                // The kernel copies the timespec while preparing the entry,
                // and count(1) retires it as soon as anything else completes.
                *self.timeout_spec = types::Timespec::from(timeout);
                let entry = opcode::Timeout::new(&*self.timeout_spec)
                    .count(1)
                    .build()
                    .user_data(TIMEOUT_USER_DATA);
                self.push_entry(&entry)?;
                self.ring.submit_and_wait(1)
            }
        };

        match result {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.raw_os_error(), Some(libc::ETIME | libc::EINTR | libc::EBUSY)) => {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn drain(&mut self, out: &mut Vec<(u64, i32)>) {
        let mut rearm = false;
        for cqe in self.ring.completion() {
            match cqe.user_data() {
                WAKE_USER_DATA => rearm = true,
                TIMEOUT_USER_DATA => {}
                user_data => {
                    self.in_flight = self.in_flight.saturating_sub(1);
                    out.push((user_data, cqe.result()));
                }
            }
        }

        if rearm {
            if let Err(e) = self.arm_wake() {
                crate::log_error!("backend", "failed to re-arm wakeup read: {}", e);
            }
        }
    }

    fn operations_in_flight(&self) -> usize {
        self.in_flight
    }

    fn name(&self) -> &'static str {
        "io_uring"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Notifier;
    use std::os::unix::io::AsRawFd;

    // Sandboxes commonly forbid io_uring_setup; skip rather than fail there.
    fn backend(notifier: &Notifier) -> Option<IoUringBackend> {
        IoUringBackend::new(8, notifier.as_raw_fd()).ok()
    }

    fn drain_until(backend: &mut IoUringBackend, want: usize) -> Vec<(u64, i32)> {
        let mut out = Vec::new();
        while out.len() < want {
            backend.wait(Some(Duration::from_millis(100))).unwrap();
            backend.drain(&mut out);
        }
        out
    }

    #[test]
    fn wait_times_out_without_work() {
        let notifier = Notifier::new().unwrap();
        let Some(mut backend) = backend(&notifier) else {
            return;
        };

        let start = std::time::Instant::now();
        backend.wait(Some(Duration::from_millis(20))).unwrap();
        let mut out = Vec::new();
        backend.drain(&mut out);
        assert!(out.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn wakeup_is_swallowed_and_rearmed() {
        let notifier = Notifier::new().unwrap();
        let Some(mut backend) = backend(&notifier) else {
            return;
        };

        for _ in 0..2 {
            notifier.notify().unwrap();
            backend.wait(Some(Duration::from_secs(1))).unwrap();
            let mut out = Vec::new();
            backend.drain(&mut out);
            assert!(out.is_empty());
        }
    }

    #[test]
    fn write_then_read_through_the_ring() {
        let notifier = Notifier::new().unwrap();
        let Some(mut backend) = backend(&notifier) else {
            return;
        };
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();

        let data = *b"ring";
        backend
            .push(
                1,
                &OpDescriptor::Write {
                    fd,
                    buf: data.as_ptr(),
                    len: 4,
                    offset: 0,
                    dsync: false,
                },
            )
            .unwrap();
        backend.submit().unwrap();
        assert_eq!(drain_until(&mut backend, 1), vec![(1, 4)]);

        let mut back = [0u8; 4];
        backend
            .push(
                2,
                &OpDescriptor::Read {
                    fd,
                    buf: back.as_mut_ptr(),
                    len: 4,
                    offset: 0,
                },
            )
            .unwrap();
        backend.submit().unwrap();
        assert_eq!(drain_until(&mut backend, 1), vec![(2, 4)]);
        assert_eq!(&back, b"ring");
        assert_eq!(backend.operations_in_flight(), 0);
    }
}
