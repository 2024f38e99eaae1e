use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, instrument};

use crate::error::{Error, Result};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Work that stays registered with the loop until it reaches a terminal state
pub(crate) trait Outstanding: Send + Sync {
    /// The loop stopped before the work could finish
    fn abandon(&self);
}

type Registry = Arc<Mutex<BTreeMap<u64, Arc<dyn Outstanding>>>>;

enum Message {
    Run { task: Task, posted_at: Instant },
    Shutdown,
}

/// A single-threaded cooperative event loop
///
/// Closures posted with [`EventLoop::run_in_thread`] run one at a time, in posting order, on a
/// dedicated thread that also drives timers and socket readiness waits.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

struct LoopInner {
    tx: mpsc::UnboundedSender<Message>,
    handle: tokio::runtime::Handle,
    thread_id: ThreadId,
    closed: AtomicBool,
    callback_delay_us: Arc<AtomicU64>,
    outstanding: Registry,
    next_id: AtomicU64,
}

impl EventLoop {
    /// Start a new loop on a thread named `name`
    pub fn spawn(name: &str) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let callback_delay_us = Arc::new(AtomicU64::new(0));
        let delay = Arc::clone(&callback_delay_us);
        let outstanding = Registry::default();
        let registry = Arc::clone(&outstanding);

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(message) = rx.recv().await {
                        match message {
                            Message::Run { task, posted_at } => {
                                record_delay(&delay, posted_at.elapsed());
                                task();
                            }
                            Message::Shutdown => break,
                        }
                    }
                    abandon_all(&registry);
                });
                debug!("event loop stopped");
            })?;

        Ok(Self {
            inner: Arc::new(LoopInner {
                tx,
                handle,
                thread_id: thread.thread().id(),
                closed: AtomicBool::new(false),
                callback_delay_us,
                outstanding,
                next_id: AtomicU64::new(0),
            }),
        })
    }

    /// Run `f` on the loop thread. Fails if the loop no longer accepts work.
    pub fn run_in_thread<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::DispatchError);
        }
        self.inner
            .tx
            .send(Message::Run {
                task: Box::new(f),
                posted_at: Instant::now(),
            })
            .map_err(|_closed| Error::DispatchError)
    }

    pub fn is_in_loop_thread(&self) -> bool {
        std::thread::current().id() == self.inner.thread_id
    }

    /// Stop accepting work. Closures already queued before the call still run; work still
    /// outstanding afterwards is abandoned on the loop thread.
    #[instrument(skip_all)]
    pub fn shutdown(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            let _ = self.inner.tx.send(Message::Shutdown);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.inner.tx.is_closed()
    }

    /// Moving average of the delay between posting a closure and running it
    pub fn callback_delay_avg(&self) -> Duration {
        Duration::from_micros(self.inner.callback_delay_us.load(Ordering::Relaxed))
    }

    /// Keep `work` alive until [`EventLoop::unregister`] or until the loop stops
    pub(crate) fn register(&self, work: Arc<dyn Outstanding>) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.outstanding.lock().insert(id, work);
        id
    }

    pub(crate) fn unregister(&self, id: u64) -> Option<Arc<dyn Outstanding>> {
        self.inner.outstanding.lock().remove(&id)
    }

    /// Number of operations that were started and have not completed yet
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.lock().len()
    }

    /// Drive `fut` on the loop thread
    pub(crate) fn spawn_task<F>(&self, fut: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.handle.spawn(fut).abort_handle()
    }

    /// Run blocking work on the runtime's blocking pool, never on the loop thread
    pub(crate) fn spawn_blocking<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        drop(self.inner.handle.spawn_blocking(f));
    }
}

fn abandon_all(registry: &Registry) {
    let abandoned = std::mem::take(&mut *registry.lock());
    if !abandoned.is_empty() {
        debug!(count = abandoned.len(), "abandoning outstanding work");
    }
    for work in abandoned.into_values() {
        work.abandon();
    }
}

fn record_delay(avg: &AtomicU64, sample: Duration) {
    let sample = u64::try_from(sample.as_micros()).unwrap_or(u64::MAX);
    let old = avg.load(Ordering::Relaxed);
    let new = (old.saturating_mul(7).saturating_add(sample)) >> 3;
    avg.store(new, Ordering::Relaxed);
}

/// A cancellable one-shot timer whose callback runs on the loop thread
#[derive(Default)]
pub struct Timer {
    pending: Option<AbortHandle>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `f` to run after `after`, replacing any pending schedule
    pub fn schedule<F>(&mut self, event_loop: &EventLoop, after: Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();
        self.pending = Some(event_loop.spawn_task(async move {
            tokio::time::sleep(after).await;
            f();
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.pending.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}
