//! The owning execution context file handles run on.
//!
//! A [`Reactor`] is a single thread that owns a completion backend. File
//! handles register with it, submit descriptors through their
//! [`Registration`], and receive every [`CompletionEvent`] back on that same
//! thread through [`IoHandle::handle`]. Work from other threads is posted with
//! [`Reactor::execute`] and runs in FIFO order between completion batches.
//!
//! [`EventLoop`] is the production reactor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::error::Result;
use crate::operation::{CompletionEvent, OpDescriptor};

mod affinity;
mod event_loop;
mod notifier;
#[cfg(test)]
pub(crate) mod testing;

pub(crate) use affinity::AffinityCell;
pub use event_loop::{EventLoop, EventLoopHandle};
pub use notifier::Notifier;

/// One-shot work posted to the owning thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Work re-run at a fixed period on the owning thread.
pub type PeriodicTask = Box<dyn FnMut() + Send + 'static>;

/// Cancellation handle of a periodic task.
#[derive(Debug, Clone, Default)]
pub struct ScheduledTask {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop future runs. A run already in progress finishes.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Receiver of completion events for one registration.
pub trait IoHandle: Send + Sync {
    /// Called on the owning thread for every completion routed to this handle.
    fn handle(self: Arc<Self>, event: CompletionEvent);

    /// Called on the owning thread once the reactor has stopped; no further
    /// completions will arrive.
    fn on_shutdown(&self) {}
}

/// A handle's channel into the reactor.
pub trait Registration: Send {
    /// Queue `op`, tagged with `tag`, for submission.
    ///
    /// Returns the correlation id the operation travels under; a later
    /// [`OpDescriptor::Cancel`] aimed at that id cancels it. Must be called on
    /// the owning thread.
    fn submit(&self, tag: u16, op: OpDescriptor) -> Result<u64>;

    /// Refuse further submissions. Completions of operations already queued
    /// are still delivered.
    fn cancel(&self);

    fn is_valid(&self) -> bool;
}

/// Single-threaded owner of a completion backend.
pub trait Reactor: Send + Sync {
    /// Thread every handle callback and registration call runs on.
    fn owner(&self) -> ThreadId;

    fn in_event_loop(&self) -> bool {
        thread::current().id() == self.owner()
    }

    /// Run `task` on the owning thread after the current iteration's work.
    fn execute(&self, task: Task) -> Result<()>;

    /// Run `task` every `period` on the owning thread until cancelled.
    fn schedule_at_fixed_rate(&self, period: Duration, task: PeriodicTask) -> ScheduledTask;

    /// Route completions of a new registration to `handle`. Must be called on
    /// the owning thread.
    fn register(&self, handle: Arc<dyn IoHandle>) -> Result<Box<dyn Registration>>;
}
