//! The per-file state machine.
//!
//! A [`FileHandle`] is shared by every clone of a [`File`](super::File) and by
//! the reactor route that delivers its completions. Its mutable core lives in
//! an [`AffinityCell`] owned by the reactor thread: calls made there touch the
//! core directly, calls made anywhere else are posted to the reactor and
//! answered through a proxy future.
//!
//! ```text
//! Initializing -> Initialized -> Opening -> Open -> Closing -> Closed
//!                      ^            |                  ^
//!                      +-- failure -+---- close() -----+
//! ```

use std::ffi::CString;
use std::fmt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::{UringFileConfig, WatchdogConfig};
use crate::error::{fatal, Error};
use crate::future::CompletionFuture;
use crate::logging::{self, LogLevel, OpContext};
use crate::open_options::OpenTarget;
use crate::operation::{CompletionEvent, OpDescriptor, OpKind, CANCEL_ALL_TAG, CLOSE_TAG};
use crate::reactor::{AffinityCell, IoHandle, Reactor, Registration, ScheduledTask};
use crate::registry::OperationRegistry;

/// Lifecycle state of a file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleState {
    /// Created, not yet registered with the reactor
    Initializing,
    /// Registered; the open has not been issued or has failed
    Initialized,
    /// Open submitted
    Opening,
    /// Descriptor valid; data operations accepted
    Open,
    /// Draining in-flight operations before the descriptor is closed
    Closing,
    /// Terminal
    Closed,
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleState::Initializing => "initializing",
            HandleState::Initialized => "initialized",
            HandleState::Opening => "opening",
            HandleState::Open => "open",
            HandleState::Closing => "closing",
            HandleState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Per-handle settings taken from the loop configuration.
#[derive(Debug, Clone)]
pub(crate) struct HandleSettings {
    pub capacity: usize,
    pub watchdog: WatchdogConfig,
}

impl HandleSettings {
    pub(crate) fn from_config(config: &UringFileConfig) -> Self {
        Self {
            capacity: config.registry.capacity,
            watchdog: config.watchdog.clone(),
        }
    }
}

/// Which states a submission is allowed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    /// `Open` only
    Data,
    /// The open itself, issued in `Opening`
    Opening,
}

/// State only the reactor thread touches.
pub(super) struct HandleCore {
    pub(super) state: HandleState,
    pub(super) registry: OperationRegistry,
    pub(super) fd: RawFd,
    pub(super) registration: Option<Box<dyn Registration>>,
    pub(super) watchdog: Option<ScheduledTask>,
    pub(super) close_submitted: bool,
    /// Cancellations submitted and not yet completed; they hold no slot
    pub(super) cancels_in_flight: usize,
    pub(super) cancel_all_sent: bool,
    native_path: CString,
    flags: i32,
    mode: u32,
}

/// Fails `target` with [`Error::LoopShutdown`] unless settled first.
///
/// Posted tasks carry one so that a task the reactor discards, rather than
/// runs, still resolves the future its caller is waiting on.
struct Pending<T: Clone + Send + 'static> {
    target: Option<CompletionFuture<T>>,
}

impl<T: Clone + Send + 'static> Pending<T> {
    fn new(target: CompletionFuture<T>) -> Self {
        Self {
            target: Some(target),
        }
    }

    fn forward(mut self, source: CompletionFuture<T>) {
        if let Some(target) = self.target.take() {
            if let Err(e) = source.forward_to(target.clone()) {
                target.resolve_or_fatal("file", Err(e));
            }
        }
    }

    fn disarm(mut self) {
        self.target = None;
    }
}

impl<T: Clone + Send + 'static> Drop for Pending<T> {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            let _ = target.fail(Error::LoopShutdown);
        }
    }
}

/// State machine coordinating submissions, completions and close of one file.
pub(crate) struct FileHandle {
    reactor: Arc<dyn Reactor>,
    pub(super) core: AffinityCell<HandleCore>,
    settings: HandleSettings,
    open_future: CompletionFuture,
    open_requested: AtomicBool,
    close_future: CompletionFuture,
    close_requested: AtomicBool,
    path: PathBuf,
    anonymous: bool,
}

impl FileHandle {
    pub(crate) fn new(
        reactor: Arc<dyn Reactor>,
        settings: HandleSettings,
        target: OpenTarget,
    ) -> crate::Result<Arc<Self>> {
        let core = HandleCore {
            state: HandleState::Initializing,
            registry: OperationRegistry::new(settings.capacity)?,
            fd: -1,
            registration: None,
            watchdog: None,
            close_submitted: false,
            cancels_in_flight: 0,
            cancel_all_sent: false,
            native_path: target.native,
            flags: target.flags,
            mode: target.mode,
        };
        Ok(Arc::new(Self {
            core: AffinityCell::new(reactor.owner(), core),
            reactor,
            settings,
            open_future: CompletionFuture::with_op(OpKind::OpenAt),
            open_requested: AtomicBool::new(false),
            close_future: CompletionFuture::with_op(OpKind::Close),
            close_requested: AtomicBool::new(false),
            path: target.path,
            anonymous: target.anonymous,
        }))
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    /// Run `f` against the core on the reactor thread.
    ///
    /// Runs inline when already there and the core is free; otherwise the
    /// work is posted and runs in FIFO order with other reactor work.
    fn run_on_loop<F>(self: &Arc<Self>, f: F)
    where
        F: FnOnce(&Arc<Self>, &mut HandleCore) + Send + 'static,
    {
        if let Some(mut core) = self.core.try_borrow_mut() {
            f(self, &mut core);
            return;
        }
        let this = Arc::clone(self);
        if let Err(e) = self.reactor.execute(Box::new(move || this.run_on_loop(f))) {
            crate::log_debug!("file", "{}: work dropped: {}", self.path.display(), e);
        }
    }

    /// Like [`run_on_loop`](Self::run_on_loop), bridging the future `f`
    /// produces back to the caller.
    fn call<T, F>(self: &Arc<Self>, op: OpKind, f: F) -> CompletionFuture<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&Arc<Self>, &mut HandleCore) -> CompletionFuture<T> + Send + 'static,
    {
        if let Some(mut core) = self.core.try_borrow_mut() {
            return f(self, &mut core);
        }
        let proxy = CompletionFuture::with_op(op);
        let pending = Pending::new(proxy.clone());
        self.run_on_loop(move |this, core| pending.forward(f(this, core)));
        proxy
    }

    /// Issue the open. Idempotent: every call returns the same future.
    pub(crate) fn open(self: &Arc<Self>) -> CompletionFuture {
        if !self.open_requested.swap(true, Ordering::AcqRel) {
            let pending = Pending::new(self.open_future.clone());
            self.run_on_loop(move |this, core| {
                pending.disarm();
                this.start_open(core);
            });
        }
        self.open_future.clone()
    }

    fn start_open(self: &Arc<Self>, core: &mut HandleCore) {
        if core.state == HandleState::Initializing {
            if let Err(e) = self.init(core) {
                self.open_future.resolve_or_fatal("file", Err(e));
                return;
            }
        }
        match core.state {
            HandleState::Initialized => {}
            HandleState::Closing | HandleState::Closed => {
                self.open_future.resolve_or_fatal("file", Err(Error::HandleClosed));
                return;
            }
            state => {
                self.open_future
                    .resolve_or_fatal("file", Err(Error::NotOpen { state }));
                return;
            }
        }

        core.state = HandleState::Opening;
        let (path, flags, mode) = (core.native_path.as_ptr() as usize, core.flags, core.mode);
        let submitted = self.submit_internal(core, OpKind::OpenAt, Gate::Opening, move |_| {
            OpDescriptor::OpenAt {
                path: path as *const libc::c_char,
                flags,
                mode,
            }
        });
        if let Some(Err(e)) = submitted.try_result() {
            core.state = HandleState::Initialized;
            self.open_future.resolve_or_fatal("file", Err(e));
        }
    }

    /// Register with the reactor and start the watchdog.
    fn init(self: &Arc<Self>, core: &mut HandleCore) -> crate::Result<()> {
        let registration = self
            .reactor
            .register(Arc::clone(self) as Arc<dyn IoHandle>)?;
        core.registration = Some(registration);
        core.state = HandleState::Initialized;

        let watchdog = &self.settings.watchdog;
        if watchdog.enabled {
            let weak = Arc::downgrade(self);
            core.watchdog = Some(self.reactor.schedule_at_fixed_rate(
                watchdog.period,
                Box::new(move || {
                    if let Some(handle) = weak.upgrade() {
                        handle.check_stuck_ops(Instant::now());
                    }
                }),
            ));
        }
        Ok(())
    }

    /// Submit a data operation built from the open descriptor.
    pub(crate) fn submit<B>(self: &Arc<Self>, op: OpKind, build: B) -> CompletionFuture
    where
        B: FnOnce(RawFd) -> OpDescriptor + Send + 'static,
    {
        self.call(op, move |this, core| {
            this.submit_internal(core, op, Gate::Data, build)
        })
    }

    fn submit_internal<B>(
        &self,
        core: &mut HandleCore,
        op: OpKind,
        gate: Gate,
        build: B,
    ) -> CompletionFuture
    where
        B: FnOnce(RawFd) -> OpDescriptor,
    {
        let refused = match (gate, core.state) {
            (_, HandleState::Closing | HandleState::Closed) => Some(Error::HandleClosed),
            (Gate::Data, HandleState::Open) | (Gate::Opening, HandleState::Opening) => None,
            (_, state) => Some(Error::NotOpen { state }),
        };
        if let Some(error) = refused {
            return CompletionFuture::failed(op, error);
        }
        let Some(registration) = core.registration.as_deref() else {
            return CompletionFuture::failed(op, Error::RegistrationInvalid);
        };

        let (id, future) = match core.registry.allocate(op) {
            Ok(slot) => (slot.id(), slot.future().clone()),
            Err(e) => return CompletionFuture::failed(op, e),
        };
        match registration.submit(id, build(core.fd)) {
            Ok(correlation_id) => {
                core.registry.set_correlation_id(id, correlation_id);
                logging::log_op(
                    LogLevel::Trace,
                    "file",
                    OpContext::new(op)
                        .correlation_id(Some(correlation_id))
                        .fd(core.fd),
                    format_args!("{} submitted on slot {}", op, id),
                );
            }
            Err(e) => {
                crate::log_debug!("file", "{} on slot {} rejected: {}", op, id, e);
                core.registry.release(id, e);
            }
        }
        future
    }

    fn on_completion_event(&self, core: &mut HandleCore, event: CompletionEvent) {
        if event.is_close() {
            if !core.close_submitted {
                fatal(
                    "file",
                    &format!(
                        "{}: close completion without a close submission",
                        self.path.display()
                    ),
                );
            }
            crate::log_debug!(
                "file",
                "{}: close completed with {}",
                self.path.display(),
                event.result
            );
            if self.close_future.complete(event.result).is_err() {
                fatal("file", "close future resolved twice");
            }
            return;
        }

        if event.is_cancel() {
            self.on_cancel_completion(core, event);
        } else {
            self.on_data_completion(core, event);
        }
        self.cancel_outstanding(core);
        self.submit_close_if_ready(core);
    }

    fn on_data_completion(&self, core: &mut HandleCore, event: CompletionEvent) {
        let expected = core
            .registry
            .slot(event.tag)
            .filter(|slot| slot.is_in_use())
            .map(|slot| slot.op());
        match expected {
            Some(op) if op == event.op => {
                trace_completion(core, event);
                core.registry.complete_from_event(event.tag, event.result);
                if op == OpKind::OpenAt {
                    self.on_open_result(core, event.result);
                }
            }
            Some(op) => crate::log_warn!(
                "file",
                "slot {} holds {} but completion reports {}; ignored",
                event.tag,
                op,
                event.op
            ),
            None => crate::log_trace!(
                "file",
                "stale {} completion for slot {}",
                event.op,
                event.tag
            ),
        }
    }

    fn on_cancel_completion(&self, core: &mut HandleCore, event: CompletionEvent) {
        match core.cancels_in_flight.checked_sub(1) {
            Some(left) => core.cancels_in_flight = left,
            None => {
                crate::log_warn!(
                    "file",
                    "{}: cancel completion for tag {} without a cancel in flight",
                    self.path.display(),
                    event.tag
                );
                return;
            }
        }

        // Cancel-all by descriptor needs Linux 5.19; older kernels reject it.
        if event.tag == CANCEL_ALL_TAG
            && event.result == -libc::EINVAL
            && core.state == HandleState::Closing
        {
            crate::log_debug!(
                "file",
                "{}: cancel-all rejected, cancelling {} operations one by one",
                self.path.display(),
                core.registry.in_flight()
            );
            self.cancel_each(core);
        } else {
            crate::log_trace!(
                "file",
                "cancel with tag {} completed with {}",
                event.tag,
                event.result
            );
        }
    }

    fn on_open_result(&self, core: &mut HandleCore, result: i32) {
        match core.state {
            HandleState::Opening if result >= 0 => {
                core.fd = result;
                core.state = HandleState::Open;
                crate::log_debug!("file", "opened {} as fd {}", self.path.display(), result);
                self.open_future.resolve_or_fatal("file", Ok(result));
            }
            HandleState::Opening => {
                core.state = HandleState::Initialized;
                self.open_future
                    .resolve_or_fatal("file", Err(Error::syscall(OpKind::OpenAt, result)));
            }
            HandleState::Closing => {
                // Closed while opening: the descriptor goes through the
                // normal close path.
                if result >= 0 {
                    core.fd = result;
                }
                self.open_future.resolve_or_fatal("file", Err(Error::HandleClosed));
            }
            state => crate::log_warn!(
                "file",
                "{}: open completed in state {}",
                self.path.display(),
                state
            ),
        }
    }

    /// Close the handle. Idempotent: every call returns the same future.
    pub(crate) fn close(self: &Arc<Self>) -> CompletionFuture {
        if !self.close_requested.swap(true, Ordering::AcqRel) {
            let pending = Pending::new(self.close_future.clone());
            self.run_on_loop(move |this, core| {
                pending.disarm();
                this.begin_close(core);
            });
        }
        self.close_future.clone()
    }

    fn begin_close(&self, core: &mut HandleCore) {
        match core.state {
            HandleState::Initializing | HandleState::Initialized => {
                core.state = HandleState::Closed;
                self.sever(core);
                self.close_future.resolve_or_fatal("file", Ok(0));
            }
            // The open completion re-enters submit_close_if_ready.
            HandleState::Opening => core.state = HandleState::Closing,
            HandleState::Open => {
                core.state = HandleState::Closing;
                let valid = core
                    .registration
                    .as_deref()
                    .map_or(false, |registration| registration.is_valid());
                if !valid {
                    // Nothing can complete any more, so nothing can drain.
                    core.registry.release_all(Error::RegistrationInvalid);
                    close_now(core);
                    core.state = HandleState::Closed;
                    self.sever(core);
                    self.close_future.resolve_or_fatal("file", Ok(0));
                    return;
                }

                self.cancel_outstanding(core);
                self.submit_close_if_ready(core);
            }
            HandleState::Closing | HandleState::Closed => {}
        }
    }

    /// While closing, ask the kernel to cancel everything still in flight on
    /// the descriptor.
    ///
    /// A refused cancel-all is retried after the next completion or watchdog
    /// tick, whichever comes first.
    fn cancel_outstanding(&self, core: &mut HandleCore) {
        if core.state != HandleState::Closing
            || core.cancel_all_sent
            || core.fd < 0
            || core.registry.is_empty()
        {
            return;
        }
        let fd = core.fd;
        match self.submit_cancel(core, CANCEL_ALL_TAG, OpDescriptor::CancelAll { fd }) {
            Ok(()) => core.cancel_all_sent = true,
            Err(e) => crate::log_warn!(
                "file",
                "{}: cancel-all of fd {} refused, retrying: {}",
                self.path.display(),
                fd,
                e
            ),
        }
    }

    /// Cancel every accepted operation by its correlation id.
    fn cancel_each(&self, core: &mut HandleCore) {
        let targets: Vec<(u16, u64)> = core
            .registry
            .iter()
            .filter_map(|slot| Some((slot.id(), slot.correlation_id()?)))
            .collect();
        for (tag, target) in targets {
            if let Err(e) = self.submit_cancel(core, tag, OpDescriptor::Cancel { target }) {
                crate::log_warn!(
                    "file",
                    "{}: cancel of slot {} refused: {}",
                    self.path.display(),
                    tag,
                    e
                );
            }
        }
    }

    /// Submit a cancellation outside the registry.
    ///
    /// Cancellations never take a slot, so a registry full of wedged
    /// operations can still be cancelled. They are counted instead, and the
    /// close waits for the count to reach zero as well.
    fn submit_cancel(
        &self,
        core: &mut HandleCore,
        tag: u16,
        cancel: OpDescriptor,
    ) -> crate::Result<()> {
        let registration = core
            .registration
            .as_deref()
            .ok_or(Error::RegistrationInvalid)?;
        let correlation_id = registration.submit(tag, cancel)?;
        core.cancels_in_flight += 1;
        logging::log_op(
            LogLevel::Trace,
            "file",
            OpContext::new(OpKind::AsyncCancel)
                .correlation_id(Some(correlation_id))
                .fd(core.fd),
            format_args!("cancel submitted with tag {}", tag),
        );
        Ok(())
    }

    /// Submit the close once the handle is closing and fully drained.
    ///
    /// Called after every completion; does nothing until the last in-flight
    /// operation and cancellation are gone, so the descriptor number cannot be
    /// reused while the kernel may still complete something against it.
    fn submit_close_if_ready(&self, core: &mut HandleCore) {
        if core.state != HandleState::Closing
            || core.close_submitted
            || !core.registry.is_empty()
            || core.cancels_in_flight > 0
        {
            return;
        }
        core.close_submitted = true;

        if core.fd < 0 {
            core.state = HandleState::Closed;
            self.sever(core);
            self.close_future.resolve_or_fatal("file", Ok(0));
            return;
        }

        let fd = core.fd;
        let submitted = match core.registration.as_deref() {
            Some(registration) => registration.submit(CLOSE_TAG, OpDescriptor::Close { fd }),
            None => Err(Error::RegistrationInvalid),
        };
        core.state = HandleState::Closed;
        core.fd = -1;
        self.sever(core);

        match submitted {
            Ok(_) => crate::log_debug!("file", "{}: close of fd {} submitted", self.path.display(), fd),
            Err(e) => {
                crate::log_warn!(
                    "file",
                    "{}: close of fd {} not submitted: {}",
                    self.path.display(),
                    fd,
                    e
                );
                self.close_future.resolve_or_fatal("file", Err(e));
            }
        }
    }

    /// Stop the watchdog and new submissions; completions already queued
    /// still arrive.
    fn sever(&self, core: &mut HandleCore) {
        if let Some(watchdog) = core.watchdog.take() {
            watchdog.cancel();
        }
        if let Some(registration) = core.registration.as_deref() {
            registration.cancel();
        }
    }

    /// Release slots the reactor never accepted and cancel the rest once they
    /// exceed the operation timeout. Runs until the handle is closed, so it
    /// also retries a refused cancel-all while closing.
    pub(crate) fn check_stuck_ops(&self, now: Instant) {
        let Some(mut guard) = self.core.try_borrow_mut() else {
            return;
        };
        let core = &mut *guard;
        let timeout = self.settings.watchdog.op_timeout;

        for stuck in core.registry.scan_stuck_at(now, timeout) {
            match stuck.correlation_id {
                None => {
                    crate::log_warn!(
                        "watchdog",
                        "{} on slot {} never accepted after {:?}; releasing",
                        stuck.op,
                        stuck.id,
                        stuck.age
                    );
                    core.registry.release(
                        stuck.id,
                        Error::Timeout(format!("{} not accepted within {:?}", stuck.op, timeout)),
                    );
                }
                Some(target) => {
                    crate::log_warn!(
                        "watchdog",
                        "{} on slot {} stuck for {:?}; cancelling",
                        stuck.op,
                        stuck.id,
                        stuck.age
                    );
                    let cancel = OpDescriptor::Cancel { target };
                    if let Err(e) = self.submit_cancel(core, stuck.id, cancel) {
                        crate::log_warn!(
                            "watchdog",
                            "cancel of slot {} refused, retrying next tick: {}",
                            stuck.id,
                            e
                        );
                    }
                }
            }
        }
        self.cancel_outstanding(core);
        self.submit_close_if_ready(core);
    }

    /// Remove the file's name. In-flight operations are not waited for; they
    /// keep working on the open descriptor.
    pub(crate) fn unlink(self: &Arc<Self>) -> CompletionFuture {
        if self.anonymous {
            return CompletionFuture::failed(OpKind::UnlinkAt, Error::AnonymousUnlink);
        }
        self.call(OpKind::UnlinkAt, |this, core| {
            let path = core.native_path.as_ptr() as usize;
            this.submit_internal(core, OpKind::UnlinkAt, Gate::Data, move |_| {
                OpDescriptor::UnlinkAt {
                    path: path as *const libc::c_char,
                    flags: 0,
                }
            })
        })
    }

    pub(crate) fn state(self: &Arc<Self>) -> CompletionFuture<HandleState> {
        self.call(OpKind::Nop, |_, core| {
            CompletionFuture::ready(OpKind::Nop, core.state)
        })
    }

    pub(crate) fn in_flight(self: &Arc<Self>) -> CompletionFuture<usize> {
        self.call(OpKind::Nop, |_, core| {
            CompletionFuture::ready(OpKind::Nop, core.registry.in_flight())
        })
    }
}

fn trace_completion(core: &HandleCore, event: CompletionEvent) {
    if !logging::enabled(LogLevel::Trace) {
        return;
    }
    if let Some(slot) = core.registry.slot(event.tag) {
        let context = OpContext::new(slot.op())
            .correlation_id(slot.correlation_id())
            .fd(core.fd)
            .elapsed(slot.submitted_at().elapsed());
        logging::log_op(
            LogLevel::Trace,
            "file",
            context,
            format_args!("{} on slot {} completed with {}", slot.op(), event.tag, event.result),
        );
    }
}

/// Close the descriptor synchronously. Only valid when no backend can still
/// reference it.
fn close_now(core: &mut HandleCore) {
    if core.fd >= 0 {
        // SAFETY: the handle owns the descriptor and nothing in flight uses it.
        unsafe {
            libc::close(core.fd);
        }
        core.fd = -1;
    }
}

impl IoHandle for FileHandle {
    fn handle(self: Arc<Self>, event: CompletionEvent) {
        self.run_on_loop(move |this, core| this.on_completion_event(core, event));
    }

    fn on_shutdown(&self) {
        let Some(mut guard) = self.core.try_borrow_mut() else {
            crate::log_error!("file", "{}: core busy at shutdown", self.path.display());
            return;
        };
        let core = &mut *guard;
        let released = core.registry.release_all(Error::LoopShutdown);
        if released > 0 {
            crate::log_debug!(
                "file",
                "{}: {} operations failed by shutdown",
                self.path.display(),
                released
            );
        }
        let _ = self.open_future.fail(Error::LoopShutdown);
        let _ = self.close_future.fail(Error::LoopShutdown);
        if !core.close_submitted {
            close_now(core);
        }
        core.state = HandleState::Closed;
        self.sever(core);
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path)
            .field("anonymous", &self.anonymous)
            .field("owner", &self.core.owner())
            .finish()
    }
}
