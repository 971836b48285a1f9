//! Scripted reactor for driving handles deterministically in unit tests.
//!
//! Nothing reaches a kernel: submissions are recorded, and the test decides
//! when and how each one completes.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

use super::{IoHandle, PeriodicTask, Reactor, Registration, ScheduledTask, Task};
use crate::error::{Error, Result};
use crate::operation::wire;
use crate::operation::{CompletionEvent, OpDescriptor, OpKind};

/// One recorded submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Submitted {
    pub route: usize,
    pub tag: u16,
    pub op: OpKind,
    pub fd: Option<RawFd>,
    /// Correlation id of the operation a `Cancel` targets
    pub cancel_target: Option<u64>,
    pub user_data: u64,
    /// Position on the reactor's clock, shared with completions
    pub seq: u64,
}

#[derive(Default)]
struct ManualState {
    tasks: VecDeque<Task>,
    timers: Vec<(PeriodicTask, ScheduledTask)>,
    routes: Vec<(Arc<dyn IoHandle>, Arc<AtomicBool>)>,
    submissions: Vec<Submitted>,
    completions: Vec<(Submitted, u64)>,
    reject_next: Option<Error>,
    clock: u64,
}

impl ManualState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Reactor owned by the thread that created it.
pub(crate) struct ManualReactor {
    owner: ThreadId,
    state: Arc<Mutex<ManualState>>,
}

impl ManualReactor {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            owner: thread::current().id(),
            state: Arc::default(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap()
    }

    /// Run queued tasks, including any they queue, until none remain.
    pub(crate) fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let task = self.lock().tasks.pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    pub(crate) fn submissions(&self) -> Vec<Submitted> {
        self.lock().submissions.clone()
    }

    /// Submissions of kind `op` that have not been completed yet.
    pub(crate) fn pending(&self, op: OpKind) -> Vec<Submitted> {
        let state = self.lock();
        state
            .submissions
            .iter()
            .filter(|s| s.op == op)
            .filter(|s| !state.completions.iter().any(|(c, _)| c == *s))
            .copied()
            .collect()
    }

    /// Completed submissions with the clock value of their completion.
    pub(crate) fn completions(&self) -> Vec<(Submitted, u64)> {
        self.lock().completions.clone()
    }

    /// Make the next submission fail with `error`.
    pub(crate) fn reject_next(&self, error: Error) {
        self.lock().reject_next = Some(error);
    }

    /// Deliver the completion of `submitted` with `result`.
    pub(crate) fn complete(&self, submitted: &Submitted, result: i32) {
        let handle = {
            let mut state = self.lock();
            let at = state.tick();
            state.completions.push((*submitted, at));
            Arc::clone(&state.routes[submitted.route].0)
        };
        handle.handle(CompletionEvent {
            tag: submitted.tag,
            op: submitted.op,
            result,
        });
        self.run_pending();
    }

    /// Run every live periodic task once.
    pub(crate) fn fire_timers(&self) {
        let mut timers = std::mem::take(&mut self.lock().timers);
        for (task, handle) in timers.iter_mut() {
            if !handle.is_cancelled() {
                task();
            }
        }
        let mut state = self.lock();
        timers.append(&mut state.timers);
        state.timers = timers;
    }

    pub(crate) fn live_timers(&self) -> usize {
        self.lock()
            .timers
            .iter()
            .filter(|(_, handle)| !handle.is_cancelled())
            .count()
    }

    pub(crate) fn registration_valid(&self, route: usize) -> bool {
        self.lock().routes[route].1.load(Ordering::SeqCst)
    }

    /// Tell every registered handle the reactor has stopped.
    pub(crate) fn shutdown(&self) {
        let handles: Vec<_> = self
            .lock()
            .routes
            .iter()
            .map(|(handle, _)| Arc::clone(handle))
            .collect();
        for handle in handles {
            handle.on_shutdown();
        }
    }
}

struct ManualRegistration {
    route: usize,
    valid: Arc<AtomicBool>,
    state: Arc<Mutex<ManualState>>,
}

impl Registration for ManualRegistration {
    fn submit(&self, tag: u16, op: OpDescriptor) -> Result<u64> {
        if !self.is_valid() {
            return Err(Error::RegistrationInvalid);
        }
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.reject_next.take() {
            return Err(error);
        }
        let user_data = wire::encode(self.route as u32 + 1, op.kind(), tag);
        let seq = state.tick();
        state.submissions.push(Submitted {
            route: self.route,
            tag,
            op: op.kind(),
            fd: op.fd(),
            cancel_target: match op {
                OpDescriptor::Cancel { target } => Some(target),
                _ => None,
            },
            user_data,
            seq,
        });
        Ok(user_data)
    }

    fn cancel(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }
}

impl Reactor for ManualReactor {
    fn owner(&self) -> ThreadId {
        self.owner
    }

    fn execute(&self, task: Task) -> Result<()> {
        self.lock().tasks.push_back(task);
        Ok(())
    }

    fn schedule_at_fixed_rate(&self, _period: Duration, task: PeriodicTask) -> ScheduledTask {
        let handle = ScheduledTask::new();
        self.lock().timers.push((task, handle.clone()));
        handle
    }

    fn register(&self, handle: Arc<dyn IoHandle>) -> Result<Box<dyn Registration>> {
        let valid = Arc::new(AtomicBool::new(true));
        let mut state = self.lock();
        state.routes.push((handle, Arc::clone(&valid)));
        Ok(Box::new(ManualRegistration {
            route: state.routes.len() - 1,
            valid,
            state: Arc::clone(&self.state),
        }))
    }
}
