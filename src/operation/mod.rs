//! Asynchronous, resumable operations driven on the client's event loop.
//!
//! Every operation goes through `Unstarted -> Pending -> {Completed, Cancelled, Failed,
//! TimedOut}`. The generic driver in this module owns that lifecycle: starting, the overall
//! timeout, cancellation, socket readiness suspension and the single completion path. The
//! per-kind protocol logic lives in [`connect`] and [`fetch`].

mod collect;
mod connect;
mod fetch;
mod row_stream;
mod stream;

use std::fmt;
use std::io;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, instrument};

use crate::client::Client;
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, Outstanding, Timer};
use crate::handler::ReadyFuture;

pub use collect::{CollectConsumer, QueryResult};
pub use connect::{CertValidator, Connect, ConnectOperation};
pub use fetch::{Fetch, FetchAction, FetchConsumer, FetchOperation};
pub use row_stream::RowStream;
pub use stream::{QueryEnd, QueryStream, StreamItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Unstarted,
    Pending,
    Completed,
    Cancelled,
    Failed,
    TimedOut,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Unstarted | Self::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    Unknown,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl OperationResult {
    fn terminal_state(self) -> OperationState {
        match self {
            Self::Succeeded => OperationState::Completed,
            Self::Cancelled => OperationState::Cancelled,
            Self::TimedOut => OperationState::TimedOut,
            Self::Failed | Self::Unknown => OperationState::Failed,
        }
    }
}

impl fmt::Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "Unknown",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
            Self::TimedOut => "TimedOut",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Connect,
    /// Connect issued internally on behalf of a pool
    PooledConnect,
    Query,
    MultiQuery,
    MultiQueryStream,
}

/// State shared by every kind of operation
pub(crate) struct OperationBase {
    pub(crate) state: OperationState,
    pub(crate) result: OperationResult,
    pub(crate) kind: OperationKind,
    start: Option<Instant>,
    duration: Option<Duration>,
    pub(crate) timeout: Duration,
    pub(crate) errno: u32,
    pub(crate) error_message: String,
    pub(crate) cancel_requested: bool,
    timeout_timer: Timer,
    readiness: Option<AbortHandle>,
    /// Registration that keeps the operation alive on the loop while pending
    outstanding: Option<u64>,
}

impl OperationBase {
    fn new(kind: OperationKind, timeout: Duration) -> Self {
        Self {
            state: OperationState::Unstarted,
            result: OperationResult::Unknown,
            kind,
            start: None,
            duration: None,
            timeout,
            errno: 0,
            error_message: String::new(),
            cancel_requested: false,
            timeout_timer: Timer::new(),
            readiness: None,
            outstanding: None,
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        match (self.duration, self.start) {
            (Some(d), _) => d,
            (None, Some(start)) => start.elapsed(),
            (None, None) => Duration::ZERO,
        }
    }

    pub(crate) fn set_error(&mut self, errno: u32, message: impl Into<String>) {
        self.errno = errno;
        self.error_message = message.into();
    }

    pub(crate) fn cancel_timeout(&mut self) {
        self.timeout_timer.cancel();
    }

    pub(crate) fn stop_waiting(&mut self) {
        if let Some(readiness) = self.readiness.take() {
            readiness.abort();
        }
    }
}

pub(crate) struct Inner<S> {
    pub(crate) base: OperationBase,
    pub(crate) data: S,
    callback: Option<Box<dyn FnOnce(&Operation<S>) + Send>>,
}

pub(crate) struct Shared<S> {
    client: Client,
    inner: Mutex<Inner<S>>,
    state_tx: watch::Sender<OperationState>,
}

/// Per-kind behaviour plugged into the generic driver
pub(crate) trait OperationImpl: Sized + Send + 'static {
    /// Final adjustments before leaving `Unstarted`, with the lock held
    fn prepare_run(_inner: &mut Inner<Self>) {}

    /// Start (or restart) the protocol work. Runs on the loop thread.
    fn specialized_run(op: &Operation<Self>);

    /// Make as much progress as possible without blocking
    fn actionable(op: &Operation<Self>);

    /// The overall timeout fired while the operation was pending
    fn timeout_triggered(op: &Operation<Self>);

    /// Waiting for socket readiness failed
    fn ready_failed(op: &Operation<Self>, err: io::Error);

    /// Bookkeeping on entering a terminal state, with the lock held
    fn specialized_complete(op: &Operation<Self>, inner: &mut Inner<Self>);

    /// Notifications after the terminal state is published, without the lock
    fn after_complete(_op: &Operation<Self>, _result: OperationResult) {}
}

/// Handle to an asynchronous operation. Clones refer to the same operation.
pub struct Operation<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for Operation<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S> Operation<S> {
    pub(crate) fn with_data(client: Client, kind: OperationKind, timeout: Duration, data: S) -> Self {
        let (state_tx, _) = watch::channel(OperationState::Unstarted);
        Self {
            shared: Arc::new(Shared {
                client,
                inner: Mutex::new(Inner {
                    base: OperationBase::new(kind, timeout),
                    data,
                    callback: None,
                }),
                state_tx,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner<S>> {
        self.shared.inner.lock()
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared<S>> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn upgrade(weak: &Weak<Shared<S>>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    pub fn client(&self) -> &Client {
        &self.shared.client
    }

    pub(crate) fn event_loop(&self) -> &EventLoop {
        self.shared.client.event_loop()
    }

    pub fn state(&self) -> OperationState {
        self.lock().base.state
    }

    pub fn result(&self) -> OperationResult {
        self.lock().base.result
    }

    pub fn kind(&self) -> OperationKind {
        self.lock().base.kind
    }

    pub fn ok(&self) -> bool {
        self.result() == OperationResult::Succeeded
    }

    pub fn done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Time spent running; frozen once the operation is terminal
    pub fn elapsed(&self) -> Duration {
        self.lock().base.elapsed()
    }

    pub fn timeout(&self) -> Duration {
        self.lock().base.timeout
    }

    /// Error number captured from the backend or generated by the client; 0 if none
    pub fn errno(&self) -> u32 {
        self.lock().base.errno
    }

    pub fn error_message(&self) -> String {
        self.lock().base.error_message.clone()
    }

    /// `Ok` if the operation succeeded, otherwise the captured failure
    pub fn check(&self) -> Result<()> {
        let inner = self.lock();
        match inner.base.result {
            OperationResult::Succeeded => Ok(()),
            result => Err(Error::OperationFailed {
                result,
                errno: inner.base.errno,
                message: inner.base.error_message.clone(),
            }),
        }
    }

    /// Apply `f` if the operation has not started yet
    pub(crate) fn configure<R>(&self, f: impl FnOnce(&mut Inner<S>) -> R) -> Result<R> {
        let mut inner = self.lock();
        if inner.base.state != OperationState::Unstarted {
            return Err(Error::state(format!(
                "operation can only be configured while unstarted (state: {:?})",
                inner.base.state
            )));
        }
        Ok(f(&mut inner))
    }

    /// Register the completion callback, invoked exactly once after the operation is terminal
    pub fn set_callback<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(&Operation<S>) + Send + 'static,
    {
        self.configure(|inner| inner.callback = Some(Box::new(callback)))
    }

    /// Resolves with the result once the operation is terminal
    pub async fn wait(&self) -> OperationResult {
        let mut rx = self.shared.state_tx.subscribe();
        let _ = rx.wait_for(|state| state.is_terminal()).await;
        self.result()
    }
}

impl<S: OperationImpl> Operation<S> {
    /// Start the operation. Legal only once, from `Unstarted`.
    #[instrument(skip_all)]
    pub fn run(&self) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.base.state != OperationState::Unstarted {
                return Err(Error::state(format!(
                    "run() called on an operation in state {:?}",
                    inner.base.state
                )));
            }
            S::prepare_run(&mut inner);
            inner.base.state = OperationState::Pending;
            inner.base.start = Some(Instant::now());
            inner.base.outstanding = Some(self.event_loop().register(Arc::new(self.clone())));
        }
        self.shared.state_tx.send_replace(OperationState::Pending);

        let op = self.clone();
        if let Err(e) = self.event_loop().run_in_thread(move || op.start_in_loop()) {
            self.lock()
                .base
                .set_error(crate::constant::client_errno::CR_UNKNOWN_ERROR, e.to_string());
            self.complete_operation(OperationResult::Failed);
            return Err(e);
        }
        Ok(())
    }

    /// Request cancellation. Takes effect at the next step on the loop thread.
    pub fn cancel(&self) {
        {
            let mut inner = self.lock();
            let state = inner.base.state;
            match state {
                OperationState::Unstarted => {
                    drop(inner);
                    self.complete_operation(OperationResult::Cancelled);
                    return;
                }
                OperationState::Pending if !inner.base.cancel_requested => {
                    inner.base.cancel_requested = true;
                }
                _ => return,
            }
        }

        let op = self.clone();
        if self
            .event_loop()
            .run_in_thread(move || op.cancel_in_loop())
            .is_err()
        {
            self.complete_operation(OperationResult::Cancelled);
        }
    }

    fn start_in_loop(&self) {
        {
            let mut inner = self.lock();
            if inner.base.state != OperationState::Pending {
                return;
            }
            let timeout = inner.base.timeout;
            self.schedule_timeout(&mut inner, timeout);
        }
        S::specialized_run(self);
    }

    fn cancel_in_loop(&self) {
        {
            let mut inner = self.lock();
            if inner.base.state != OperationState::Pending {
                return;
            }
            inner.base.stop_waiting();
        }
        S::actionable(self);
    }

    /// (Re)arm the overall timeout. Zero disables it.
    pub(crate) fn schedule_timeout(&self, inner: &mut Inner<S>, after: Duration) {
        inner.base.timeout_timer.cancel();
        if after.is_zero() {
            return;
        }
        let weak = self.downgrade();
        inner
            .base
            .timeout_timer
            .schedule(self.event_loop(), after, move || {
                if let Some(op) = Operation::upgrade(&weak) {
                    op.timeout_fired();
                }
            });
    }

    fn timeout_fired(&self) {
        if self.state() != OperationState::Pending {
            return;
        }
        debug!("operation timeout fired");
        S::timeout_triggered(self);
    }

    /// Suspend until `ready` resolves, then re-enter `actionable` on the loop thread
    pub(crate) fn wait_for_actionable(&self, inner: &mut Inner<S>, ready: ReadyFuture) {
        let weak = self.downgrade();
        inner.base.stop_waiting();
        inner.base.readiness = Some(self.event_loop().spawn_task(async move {
            let outcome = ready.await;
            if let Some(op) = Operation::upgrade(&weak) {
                op.ready_in_loop(outcome);
            }
        }));
    }

    fn ready_in_loop(&self, outcome: io::Result<()>) {
        {
            let mut inner = self.lock();
            if inner.base.state != OperationState::Pending {
                return;
            }
            inner.base.readiness = None;
        }
        match outcome {
            Ok(()) => S::actionable(self),
            Err(e) => S::ready_failed(self, e),
        }
    }

    /// The single path into a terminal state
    pub(crate) fn complete_operation(&self, result: OperationResult) {
        let (result, callback, outstanding) = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            if inner.base.state.is_terminal() {
                return;
            }
            let result = if inner.base.cancel_requested && result != OperationResult::Cancelled {
                OperationResult::Cancelled
            } else {
                result
            };
            inner.base.cancel_timeout();
            inner.base.stop_waiting();
            inner.base.duration = Some(inner.base.elapsed());
            inner.base.state = result.terminal_state();
            inner.base.result = result;
            if result == OperationResult::Cancelled && inner.base.errno == 0 {
                inner.base.set_error(
                    crate::constant::ClientErrno::OperationCancelled.code(),
                    format!("({})Operation cancelled", crate::constant::ERROR_PREFIX),
                );
            }
            S::specialized_complete(self, inner);
            (result, inner.callback.take(), inner.base.outstanding.take())
        };

        debug!(%result, "operation completed");
        S::after_complete(self, result);
        if let Some(callback) = callback {
            callback(self);
        }
        self.shared.state_tx.send_replace(result.terminal_state());
        if let Some(id) = outstanding {
            drop(self.event_loop().unregister(id));
        }
    }
}

impl<S: OperationImpl> Outstanding for Operation<S> {
    fn abandon(&self) {
        {
            let mut inner = self.lock();
            if inner.base.state.is_terminal() {
                return;
            }
            inner.base.set_error(
                crate::constant::client_errno::CR_UNKNOWN_ERROR,
                Error::DispatchError.to_string(),
            );
        }
        debug!("event loop stopped under a pending operation");
        self.complete_operation(OperationResult::Failed);
    }
}

#[cfg(test)]
mod mock;
#[cfg(test)]
mod connect_test;
