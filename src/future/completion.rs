//! One-shot, multi-consumer completion future.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use super::waker::WakerSet;
use crate::error::{fatal, Error, Result};
use crate::operation::OpKind;

type Handler<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// Result of one asynchronous operation.
///
/// The future is resolved exactly once, either with a value or with an
/// [`Error`]. It can be consumed three ways, in any combination:
///
/// - blocking: [`join`](Self::join) parks the calling thread
/// - async: the type implements [`Future`] and may be awaited from any executor
/// - callback: [`on_complete`](Self::on_complete) registers one handler
///
/// Clones share the same outcome. Resolving a second time fails with
/// [`Error::AlreadyCompleted`] and leaves the first outcome in place.
///
/// Handlers run on whichever thread resolves the future (for I/O completions,
/// the event loop thread) and must not block.
pub struct CompletionFuture<T = i32> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    resolved: Condvar,
}

struct State<T> {
    op: OpKind,
    outcome: Option<Result<T>>,
    handler: Option<Handler<T>>,
    handler_registered: bool,
    wakers: WakerSet,
}

impl<T> State<T> {
    fn pending(op: OpKind) -> Self {
        Self {
            op,
            outcome: None,
            handler: None,
            handler_registered: false,
            wakers: WakerSet::default(),
        }
    }
}

impl<T> Inner<T> {
    fn new(op: OpKind) -> Self {
        Self {
            state: Mutex::new(State::pending(op)),
            resolved: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone + Send + 'static> CompletionFuture<T> {
    /// Create an unresolved future not tied to a kernel operation.
    pub fn new() -> Self {
        Self::with_op(OpKind::Nop)
    }

    /// Create an unresolved future for an operation of kind `op`.
    pub fn with_op(op: OpKind) -> Self {
        Self {
            inner: Arc::new(Inner::new(op)),
        }
    }

    /// Create a future that is already resolved with `error`.
    pub fn failed(op: OpKind, error: Error) -> Self {
        let future = Self::with_op(op);
        future.inner.lock().outcome = Some(Err(error));
        future
    }

    /// Create a future that is already resolved with `value`.
    pub fn ready(op: OpKind, value: T) -> Self {
        let future = Self::with_op(op);
        future.inner.lock().outcome = Some(Ok(value));
        future
    }

    /// Operation kind this future reports on.
    pub fn op(&self) -> OpKind {
        self.inner.lock().op
    }

    pub fn succeed(&self, value: T) -> Result<()> {
        self.resolve(Ok(value))
    }

    pub fn fail(&self, error: Error) -> Result<()> {
        self.resolve(Err(error))
    }

    /// Resolve with `outcome`, then run the handler and wake every waiter.
    pub fn resolve(&self, outcome: Result<T>) -> Result<()> {
        let (handler, handler_outcome, wakers) = {
            let mut state = self.inner.lock();
            if state.outcome.is_some() {
                return Err(Error::AlreadyCompleted);
            }
            let handler = state.handler.take();
            let handler_outcome = handler.as_ref().map(|_| outcome.clone());
            state.outcome = Some(outcome);
            (handler, handler_outcome, state.wakers.take())
        };

        if let (Some(handler), Some(outcome)) = (handler, handler_outcome) {
            self.run_handler(handler, outcome);
        }
        self.inner.resolved.notify_all();
        for waker in wakers {
            waker.wake();
        }
        Ok(())
    }

    /// Resolve a future that nothing else can have resolved.
    ///
    /// Used when forwarding one future into another. A second resolution
    /// there means two paths believe they own the same operation.
    pub(crate) fn resolve_or_fatal(&self, component: &str, outcome: Result<T>) {
        if self.resolve(outcome).is_err() {
            let op = self.op();
            fatal(component, &format!("{} future resolved twice", op));
        }
    }

    /// Register the single completion handler.
    ///
    /// If the future is already resolved the handler runs immediately on the
    /// calling thread. A second registration fails with
    /// [`Error::HandlerAlreadyRegistered`] and the handler is dropped unrun.
    pub fn on_complete<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let outcome = {
            let mut state = self.inner.lock();
            if state.handler_registered {
                return Err(Error::HandlerAlreadyRegistered);
            }
            state.handler_registered = true;
            match &state.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    state.handler = Some(Box::new(handler));
                    return Ok(());
                }
            }
        };
        self.run_handler(Box::new(handler), outcome);
        Ok(())
    }

    /// Resolve `target` with this future's outcome once it is known.
    pub fn forward_to(&self, target: CompletionFuture<T>) -> Result<()> {
        self.on_complete(move |outcome| target.resolve_or_fatal("future", outcome))
    }

    fn run_handler(&self, handler: Handler<T>, outcome: Result<T>) {
        if catch_unwind(AssertUnwindSafe(move || handler(outcome))).is_err() {
            let op = self.op();
            crate::log_error!("future", "completion handler for {} panicked", op);
        }
    }

    /// Block until the future is resolved.
    pub fn join(&self) -> Result<T> {
        let mut state = self.inner.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            state = self
                .inner
                .resolved
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block for at most `timeout`; `None` if still unresolved.
    pub fn join_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return Some(outcome.clone());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            state = self
                .inner
                .resolved
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Outcome if resolved, without blocking.
    pub fn try_result(&self) -> Option<Result<T>> {
        self.inner.lock().outcome.clone()
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().outcome.is_some()
    }

    /// True if both values observe the same outcome.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl CompletionFuture<i32> {
    /// Resolve from a raw kernel result.
    ///
    /// Non-negative results succeed with the value; negative results fail
    /// with [`Error::Syscall`] naming this future's operation.
    pub fn complete(&self, result: i32) -> Result<()> {
        if result < 0 {
            let op = self.op();
            self.fail(Error::syscall(op, result))
        } else {
            self.succeed(result)
        }
    }

    /// Prepare this future for a new operation of kind `op`.
    ///
    /// When no clone is alive the allocation is reused; otherwise a fresh
    /// future replaces it so earlier observers keep their outcome.
    pub(crate) fn recycle(&mut self, op: OpKind) {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => {
                *inner.state.get_mut().unwrap_or_else(PoisonError::into_inner) =
                    State::pending(op);
            }
            None => self.inner = Arc::new(Inner::new(op)),
        }
    }
}

impl<T> Clone for CompletionFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for CompletionFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for CompletionFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("CompletionFuture")
            .field("op", &state.op)
            .field("done", &state.outcome.is_some())
            .field("handler", &state.handler_registered)
            .finish()
    }
}

impl<T: Clone + Send + 'static> Future for CompletionFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.lock();
        match &state.outcome {
            Some(outcome) => Poll::Ready(outcome.clone()),
            None => {
                state.wakers.register(cx.waker());
                Poll::Pending
            }
        }
    }
}
