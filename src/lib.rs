//! # uring-file: asynchronous file I/O over io_uring
//!
//! Files are opened on an [`EventLoop`], a dedicated thread that owns an
//! io_uring instance (or a blocking fallback where io_uring is unavailable).
//! Every operation returns a [`CompletionFuture`] that can be awaited, joined
//! from a plain thread, or given a completion handler.
//!
//! ## Key properties
//!
//! - **Bounded in-flight work**: each file tracks its operations in a
//!   fixed-capacity registry. A full registry fails new operations with
//!   [`Error::RegistryFull`] instead of queueing them.
//! - **Buffer lending**: an [`OwnedBuffer`] belongs to the kernel while an
//!   operation uses it, and comes back with its indices advanced before the
//!   operation's future resolves.
//! - **Drain-then-close**: [`File::close`] cancels outstanding operations,
//!   waits for every one of them to complete, then closes the descriptor
//!   exactly once.
//! - **Stuck-operation watchdog**: operations older than the configured
//!   timeout are cancelled, or failed with [`Error::Timeout`] when they never
//!   reached the kernel.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use uring_file::{EventLoop, File, OpenOptions, OwnedBuffer};
//!
//! # #[tokio::main]
//! # async fn main() -> uring_file::Result<()> {
//! let event_loop = EventLoop::new()?;
//! let mut options = OpenOptions::new();
//! options.read(true).write(true).create(true).truncate(true);
//!
//! let file = File::open(&event_loop.handle(), "/tmp/uring-file.bin", &options).await?;
//!
//! let data = OwnedBuffer::from_slice(b"hello, ring");
//! let written = file.write(&data, 0, false).await?;
//!
//! let back = OwnedBuffer::new(written as usize);
//! file.read(&back, 0).await?;
//! assert_eq!(back.readable()?, b"hello, ring");
//!
//! file.close().await?;
//! event_loop.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! [`UringFileConfig`] carries the ring size, the driver choice, the registry
//! capacity, the watchdog timings and logging. [`ConfigBuilder`] validates a
//! configuration before a loop is spawned:
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use uring_file::{ConfigBuilder, DriverKind, EventLoop, WatchdogConfig};
//!
//! # fn main() -> uring_file::Result<()> {
//! let config = ConfigBuilder::new()
//!     .driver(DriverKind::Auto)
//!     .registry_capacity(256)
//!     .watchdog(WatchdogConfig {
//!         enabled: true,
//!         period: Duration::from_secs(1),
//!         op_timeout: Duration::from_secs(10),
//!     })
//!     .build()?;
//! let event_loop = EventLoop::spawn(config)?;
//! println!("driving files with {}", event_loop.backend_name());
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform support
//!
//! Linux only. The io_uring driver needs a 5.6+ kernel for the file opcodes
//! used here (`IORING_OP_OPENAT`, `IORING_OP_CLOSE`, `IORING_OP_UNLINKAT`,
//! `IORING_OP_ASYNC_CANCEL`); [`DriverKind::Auto`] falls back to the blocking
//! driver when the ring cannot be set up or lacks one of them.
//!
//! Closing a file with operations still in flight cancels them all by
//! descriptor, which the kernel supports from 5.19. On 5.6 to 5.18 that
//! request is rejected and the operations are cancelled one at a time by
//! their user data instead.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(rust_2018_idioms)]

pub mod backend;
pub mod config;
pub mod error;
pub mod file;
pub mod future;
pub mod logging;
pub mod open_options;
pub mod operation;
pub mod ownership;
pub mod reactor;
pub mod registry;

pub use config::{
    ConfigBuilder, DriverKind, LoggingConfig, RegistryConfig, RingConfig, UringFileConfig,
    WatchdogConfig,
};
pub use error::{Error, Result};
pub use file::{File, HandleState};
pub use future::CompletionFuture;
pub use logging::{LogLevel, Logger};
pub use open_options::OpenOptions;
pub use operation::OpKind;
pub use ownership::{BufferOwnership, Direction, OwnedBuffer};
pub use reactor::{EventLoop, EventLoopHandle};
