//! Thread-owning reactor built on a completion backend.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use super::{IoHandle, Notifier, PeriodicTask, Reactor, Registration, ScheduledTask, Task};
use crate::backend::{detect_backend, Backend};
use crate::config::UringFileConfig;
use crate::error::{Error, Result};
use crate::operation::wire;
use crate::operation::{CompletionEvent, OpDescriptor};

thread_local! {
    static CURRENT: RefCell<Option<Rc<LoopContext>>> = const { RefCell::new(None) };
}

/// Run `f` against the context of the loop running on this thread.
fn with_current<R>(f: impl FnOnce(&LoopContext) -> R) -> Option<R> {
    // Clone out first so `f` may itself reach for the context.
    let context = CURRENT.with(|current| current.borrow().clone())?;
    Some(f(&context))
}

struct Route {
    handle: Arc<dyn IoHandle>,
    in_flight: usize,
    cancelled: bool,
}

struct Timer {
    next: Instant,
    period: Duration,
    task: PeriodicTask,
    handle: ScheduledTask,
}

/// Loop-thread state. Never leaves the loop thread.
struct LoopContext {
    backend: RefCell<Option<Box<dyn Backend>>>,
    routes: RefCell<HashMap<u32, Route>>,
    next_token: Cell<u32>,
    timers: RefCell<Vec<Timer>>,
}

impl LoopContext {
    fn new(backend: Box<dyn Backend>) -> Self {
        Self {
            backend: RefCell::new(Some(backend)),
            routes: RefCell::new(HashMap::new()),
            next_token: Cell::new(1),
            timers: RefCell::new(Vec::new()),
        }
    }

    fn register(&self, handle: Arc<dyn IoHandle>) -> Result<u32> {
        let mut routes = self.routes.borrow_mut();
        // Token u32::MAX belongs to the backend's own entries.
        for _ in 0..u32::MAX {
            let token = self.next_token.get();
            self.next_token.set(match token.wrapping_add(1) {
                0 | u32::MAX => 1,
                next => next,
            });
            if !routes.contains_key(&token) {
                routes.insert(
                    token,
                    Route {
                        handle,
                        in_flight: 0,
                        cancelled: false,
                    },
                );
                return Ok(token);
            }
        }
        Err(Error::Submission("no free registration tokens".to_string()))
    }

    fn submit(&self, token: u32, tag: u16, op: &OpDescriptor) -> Result<u64> {
        let mut routes = self.routes.borrow_mut();
        let route = match routes.get_mut(&token) {
            Some(route) if !route.cancelled => route,
            _ => return Err(Error::RegistrationInvalid),
        };

        let mut backend = self.backend.borrow_mut();
        let backend = backend.as_mut().ok_or(Error::LoopShutdown)?;
        let user_data = wire::encode(token, op.kind(), tag);
        backend.push(user_data, op)?;
        route.in_flight += 1;
        Ok(user_data)
    }

    fn cancel_route(&self, token: u32) {
        let mut routes = self.routes.borrow_mut();
        let drained = match routes.get_mut(&token) {
            Some(route) => {
                route.cancelled = true;
                route.in_flight == 0
            }
            None => false,
        };
        if drained {
            routes.remove(&token);
        }
    }

    fn submit_pending(&self) {
        if let Some(backend) = self.backend.borrow_mut().as_mut() {
            if let Err(e) = backend.submit() {
                crate::log_error!("event_loop", "submit failed: {}", e);
            }
        }
    }

    fn wait(&self, timeout: Option<Duration>) {
        if let Some(backend) = self.backend.borrow_mut().as_mut() {
            if let Err(e) = backend.wait(timeout) {
                crate::log_error!("event_loop", "wait failed: {}", e);
            }
        }
    }

    /// Deliver every ready completion to its route.
    fn dispatch(&self) -> usize {
        let mut ready = Vec::new();
        match self.backend.borrow_mut().as_mut() {
            Some(backend) => backend.drain(&mut ready),
            None => return 0,
        }

        for &(user_data, result) in &ready {
            let token = wire::token(user_data);
            let handle = {
                let mut routes = self.routes.borrow_mut();
                let Some(route) = routes.get_mut(&token) else {
                    crate::log_warn!(
                        "event_loop",
                        "completion {:#x} for unknown route {}",
                        user_data,
                        token
                    );
                    continue;
                };
                route.in_flight = route.in_flight.saturating_sub(1);
                let handle = Arc::clone(&route.handle);
                if route.cancelled && route.in_flight == 0 {
                    routes.remove(&token);
                }
                handle
            };

            let Some(event) = CompletionEvent::decode(user_data, result) else {
                crate::log_warn!("event_loop", "undecodable completion {:#x}", user_data);
                continue;
            };
            if catch_unwind(AssertUnwindSafe(|| handle.handle(event))).is_err() {
                crate::log_error!(
                    "event_loop",
                    "handler for route {} panicked on {}",
                    token,
                    event.op
                );
            }
        }
        ready.len()
    }

    fn add_timer(&self, period: Duration, task: PeriodicTask, handle: ScheduledTask) {
        self.timers.borrow_mut().push(Timer {
            next: Instant::now() + period,
            period,
            task,
            handle,
        });
    }

    fn run_due_timers(&self, now: Instant) {
        // Taken out so a timer task may schedule further timers.
        let mut timers = std::mem::take(&mut *self.timers.borrow_mut());
        for timer in timers.iter_mut() {
            if timer.handle.is_cancelled() || timer.next > now {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| (timer.task)())).is_err() {
                crate::log_error!("event_loop", "periodic task panicked");
            }
            timer.next += timer.period;
            if timer.next <= now {
                timer.next = now + timer.period;
            }
        }
        timers.retain(|timer| !timer.handle.is_cancelled());

        let mut current = self.timers.borrow_mut();
        timers.append(&mut current);
        *current = timers;
    }

    fn next_timer_delay(&self, now: Instant) -> Option<Duration> {
        self.timers
            .borrow()
            .iter()
            .filter(|timer| !timer.handle.is_cancelled())
            .map(|timer| timer.next.saturating_duration_since(now))
            .min()
    }

    /// Tear down: the backend goes first so no completion can arrive for
    /// memory the handles are about to release.
    fn shutdown(&self) {
        drop(self.backend.borrow_mut().take());
        let handles: Vec<_> = self
            .routes
            .borrow_mut()
            .drain()
            .map(|(_, route)| route.handle)
            .collect();
        for handle in handles {
            if catch_unwind(AssertUnwindSafe(|| handle.on_shutdown())).is_err() {
                crate::log_error!("event_loop", "shutdown hook panicked");
            }
        }
        self.timers.borrow_mut().clear();
    }
}

fn run_task(task: Task) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        crate::log_error!("event_loop", "task panicked");
    }
}

struct LoopRegistration {
    token: u32,
    valid: AtomicBool,
}

impl Registration for LoopRegistration {
    fn submit(&self, tag: u16, op: OpDescriptor) -> Result<u64> {
        if !self.valid.load(Ordering::Acquire) {
            return Err(Error::RegistrationInvalid);
        }
        with_current(|context| context.submit(self.token, tag, &op))
            .unwrap_or(Err(Error::RegistrationInvalid))
    }

    fn cancel(&self) {
        if self.valid.swap(false, Ordering::AcqRel) {
            with_current(|context| context.cancel_route(self.token));
        }
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
            && with_current(|context| context.backend.borrow().is_some()).unwrap_or(false)
    }
}

struct Shared {
    tx: Sender<Task>,
    notifier: Arc<Notifier>,
    shutdown: Arc<AtomicBool>,
    owner: ThreadId,
    backend: &'static str,
    config: UringFileConfig,
}

/// Cloneable, thread-safe handle to a running [`EventLoop`].
#[derive(Clone)]
pub struct EventLoopHandle {
    shared: Arc<Shared>,
}

impl EventLoopHandle {
    /// Configuration the loop was spawned with.
    pub fn config(&self) -> &UringFileConfig {
        &self.shared.config
    }

    /// Name of the backend in use (`"io_uring"` or `"blocking"`).
    pub fn backend_name(&self) -> &'static str {
        self.shared.backend
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for EventLoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopHandle")
            .field("owner", &self.shared.owner)
            .field("backend", &self.shared.backend)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Reactor for EventLoopHandle {
    fn owner(&self) -> ThreadId {
        self.shared.owner
    }

    fn execute(&self, task: Task) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::LoopShutdown);
        }
        self.shared
            .tx
            .send(task)
            .map_err(|_| Error::LoopShutdown)?;
        if !self.in_event_loop() {
            self.shared.notifier.notify()?;
        }
        Ok(())
    }

    fn schedule_at_fixed_rate(&self, period: Duration, task: PeriodicTask) -> ScheduledTask {
        let handle = ScheduledTask::new();
        let timer = handle.clone();
        let scheduled = self.execute(Box::new(move || {
            with_current(|context| context.add_timer(period, task, timer));
        }));
        if scheduled.is_err() {
            handle.cancel();
        }
        handle
    }

    fn register(&self, handle: Arc<dyn IoHandle>) -> Result<Box<dyn Registration>> {
        if !self.in_event_loop() {
            return Err(Error::InvalidInput(
                "registration must happen on the event loop thread".to_string(),
            ));
        }
        let token = with_current(|context| context.register(handle))
            .unwrap_or(Err(Error::LoopShutdown))?;
        Ok(Box::new(LoopRegistration {
            token,
            valid: AtomicBool::new(true),
        }))
    }
}

/// A reactor thread driving an io_uring (or blocking fallback) backend.
///
/// Dropping the loop stops it: the backend is torn down, every registered
/// handle is told through [`IoHandle::on_shutdown`], and the thread is joined.
/// Handles that were never closed stay registered, and keep their buffers
/// alive, until then.
pub struct EventLoop {
    handle: EventLoopHandle,
    thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    /// Start the loop thread and wait until its backend is ready.
    pub fn spawn(config: UringFileConfig) -> Result<Self> {
        config.validate()?;
        crate::logging::configure(&config.logging);

        let notifier = Arc::new(Notifier::new()?);
        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, rx) = crossbeam_channel::unbounded::<Task>();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let thread = {
            let notifier = Arc::clone(&notifier);
            let shutdown = Arc::clone(&shutdown);
            let ring = config.ring.clone();
            thread::Builder::new()
                .name(config.ring.thread_name.clone())
                .spawn(move || {
                    let backend = match detect_backend(&ring, notifier.as_raw_fd()) {
                        Ok(backend) => backend,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(backend.name()));
                    run(backend, &rx, &shutdown);
                })?
        };

        let backend = match ready_rx.recv() {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(Error::LoopShutdown);
            }
        };
        crate::log_info!("event_loop", "started with {} backend", backend);

        Ok(Self {
            handle: EventLoopHandle {
                shared: Arc::new(Shared {
                    tx,
                    notifier,
                    shutdown,
                    owner: thread.thread().id(),
                    backend,
                    config,
                }),
            },
            thread: Some(thread),
        })
    }

    /// Spawn with the default configuration.
    pub fn new() -> Result<Self> {
        Self::spawn(UringFileConfig::default())
    }

    pub fn handle(&self) -> EventLoopHandle {
        self.handle.clone()
    }

    pub fn backend_name(&self) -> &'static str {
        self.handle.backend_name()
    }

    /// Stop the loop and wait for its thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let shared = &self.handle.shared;
        if !shared.shutdown.swap(true, Ordering::AcqRel) {
            if let Err(e) = shared.notifier.notify() {
                crate::log_error!("event_loop", "failed to wake loop for shutdown: {}", e);
            }
        }
        // Joining from the loop itself would deadlock; it exits on its own.
        if self.handle.in_event_loop() {
            return;
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                crate::log_error!("event_loop", "loop thread panicked");
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("handle", &self.handle)
            .finish()
    }
}

fn run(backend: Box<dyn Backend>, rx: &Receiver<Task>, shutdown: &AtomicBool) {
    let context = Rc::new(LoopContext::new(backend));
    CURRENT.with(|current| *current.borrow_mut() = Some(Rc::clone(&context)));

    loop {
        while let Ok(task) = rx.try_recv() {
            run_task(task);
        }
        context.run_due_timers(Instant::now());
        context.dispatch();

        if shutdown.load(Ordering::Acquire) {
            break;
        }

        context.submit_pending();
        if rx.is_empty() {
            context.wait(context.next_timer_delay(Instant::now()));
        }
        context.dispatch();
    }

    context.shutdown();
    // Tasks still queued run against closed handles and fail their futures.
    while let Ok(task) = rx.try_recv() {
        run_task(task);
    }
    CURRENT.with(|current| current.borrow_mut().take());
    crate::log_info!("event_loop", "stopped");
}
