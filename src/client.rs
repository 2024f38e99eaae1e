use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::handler::{ConnectionFactory, InternalConnection, ProtocolHandler};
use crate::operation::{ConnectOperation, OperationKind, OperationResult};
use crate::opts::ConnectionKey;

/// Entry point: owns the event loop and the backend, and creates operations
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    event_loop: EventLoop,
    handler: Arc<dyn ProtocolHandler>,
    factory: Arc<dyn ConnectionFactory>,
    active_connections: AtomicUsize,
    reused_ssl_sessions: AtomicU64,
}

impl Client {
    pub fn new<F, H>(factory: F, handler: H) -> Result<Self>
    where
        F: ConnectionFactory + 'static,
        H: ProtocolHandler + 'static,
    {
        let event_loop = EventLoop::spawn("mysql-ops-loop")?;
        Ok(Self::with_event_loop(event_loop, factory, handler))
    }

    pub fn with_event_loop<F, H>(event_loop: EventLoop, factory: F, handler: H) -> Self
    where
        F: ConnectionFactory + 'static,
        H: ProtocolHandler + 'static,
    {
        Self {
            inner: Arc::new(ClientInner {
                event_loop,
                handler: Arc::new(handler),
                factory: Arc::new(factory),
                active_connections: AtomicUsize::new(0),
                reused_ssl_sessions: AtomicU64::new(0),
            }),
        }
    }

    /// Create an unstarted connect operation for `key`
    pub fn begin_connect(&self, key: ConnectionKey) -> ConnectOperation {
        ConnectOperation::new(self.clone(), Arc::new(key), OperationKind::Connect)
    }

    /// Like [`Client::begin_connect`], for connections opened on behalf of a pool. TLS sessions
    /// negotiated by these are not stored.
    pub fn begin_pooled_connect(&self, key: ConnectionKey) -> ConnectOperation {
        ConnectOperation::new(self.clone(), Arc::new(key), OperationKind::PooledConnect)
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    pub fn handler(&self) -> &dyn ProtocolHandler {
        self.inner.handler.as_ref()
    }

    pub(crate) fn shared_handler(&self) -> Arc<dyn ProtocolHandler> {
        Arc::clone(&self.inner.handler)
    }

    pub fn active_connections(&self) -> usize {
        self.inner.active_connections.load(Ordering::Acquire)
    }

    pub fn reused_ssl_sessions(&self) -> u64 {
        self.inner.reused_ssl_sessions.load(Ordering::Relaxed)
    }

    pub fn callback_delay_avg(&self) -> Duration {
        self.inner.event_loop.callback_delay_avg()
    }

    pub(crate) fn create_connection(&self, key: &ConnectionKey) -> Box<dyn InternalConnection> {
        self.inner.factory.create_connection(key)
    }

    pub(crate) fn active_connection_added(&self, key: &ConnectionKey) {
        let n = self.inner.active_connections.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(%key, active = n, "active connection added");
    }

    pub(crate) fn active_connection_removed(&self, key: &ConnectionKey) {
        let n = self
            .inner
            .active_connections
            .fetch_sub(1, Ordering::AcqRel)
            .saturating_sub(1);
        tracing::trace!(%key, active = n, "active connection removed");
    }

    pub(crate) fn incr_reused_ssl_sessions(&self) {
        self.inner.reused_ssl_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Fire-and-forget kill of the query running on `connection_id`
    pub(crate) fn kill_query(&self, key: Arc<ConnectionKey>, connection_id: u64) {
        let factory = Arc::clone(&self.inner.factory);
        self.inner.event_loop.spawn_blocking(move || {
            if let Err(e) = factory.kill_query(&key, connection_id) {
                warn!(%key, connection_id, error = %e, "failed to kill running query");
            }
        });
    }

    pub(crate) fn log_connect_attempt(&self, record: &ConnectAttemptRecord<'_>) {
        if record.result == OperationResult::Succeeded {
            info!(
                kind = ?record.kind,
                key = %record.key,
                elapsed_ms = record.elapsed.as_millis(),
                timeout_ms = record.timeout.as_millis(),
                attempt = record.attempt,
                "connection succeeded"
            );
        } else {
            warn!(
                kind = ?record.kind,
                key = %record.key,
                reason = record.failure_reason(),
                elapsed_ms = record.elapsed.as_millis(),
                timeout_ms = record.timeout.as_millis(),
                attempt = record.attempt,
                errno = record.errno,
                message = record.message,
                "connection failed"
            );
        }
    }
}

/// Telemetry for one finished connect attempt
pub(crate) struct ConnectAttemptRecord<'a> {
    pub kind: OperationKind,
    pub key: &'a ConnectionKey,
    pub result: OperationResult,
    pub elapsed: Duration,
    pub timeout: Duration,
    pub attempt: u32,
    pub errno: u32,
    pub message: &'a str,
}

impl ConnectAttemptRecord<'_> {
    fn failure_reason(&self) -> &'static str {
        match self.result {
            OperationResult::TimedOut => "Timeout",
            OperationResult::Cancelled => "Cancelled",
            _ => "DatabaseError",
        }
    }
}
