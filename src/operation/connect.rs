use std::fmt;
use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, error, instrument, warn};

use super::{
    Inner, Operation, OperationImpl, OperationKind, OperationResult, OperationState, Shared,
};
use crate::client::{Client, ConnectAttemptRecord};
use crate::connection::{Connection, ConnectionContext};
use crate::constant::{
    CALLBACK_DELAY_STALL_THRESHOLD, ClientErrno, ClientFlags, Compression, ERROR_PREFIX,
    TOTAL_TIMEOUT_SLACK, client_errno,
};
use crate::error::{Error, Result};
use crate::event_loop::Timer;
use crate::handler::Status;
use crate::opts::{
    AttributeMap, CertValidation, CertValidationContext, ConnectionKey, ConnectionOptions,
    SslOptionsProvider,
};

/// Establishes a connection, retrying failed attempts within the total timeout
///
/// ```rs
/// let op = client.begin_connect(key);
/// op.set_connect_attempts(3)?;
/// op.run()?;
/// op.wait().await;
/// let conn = op.take_connection()?;
/// ```
pub type ConnectOperation = Operation<Connect>;

/// Connect-specific state of a [`ConnectOperation`]
pub struct Connect {
    client: Client,
    key: Arc<ConnectionKey>,
    options: Arc<ConnectionOptions>,
    flags: ClientFlags,
    attempts_made: u32,
    /// Timeout armed for the current attempt
    attempt_timeout: Duration,
    conn: Option<Connection>,
    tcp_timer: Timer,
    active_in_client: bool,
    context: ConnectionContext,
}

impl Connect {
    fn maybe_store_ssl_session(&mut self) {
        let Some(provider) = self.options.ssl_options_provider.clone() else {
            return;
        };
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if !conn.internal().has_initialized() {
            return;
        }
        if conn.internal_mut().store_session(&provider) {
            self.context.ssl_session_reused = true;
            self.client.incr_reused_ssl_sessions();
        }
    }

    fn remove_client_reference(&mut self) {
        if std::mem::take(&mut self.active_in_client) {
            self.client.active_connection_removed(&self.key);
        }
    }
}

impl Drop for Connect {
    fn drop(&mut self) {
        self.remove_client_reference();
    }
}

impl Operation<Connect> {
    pub(crate) fn new(client: Client, key: Arc<ConnectionKey>, kind: OperationKind) -> Self {
        let internal = client.create_connection(&key);
        let conn = Connection::new(client.clone(), Arc::clone(&key), internal);
        client.active_connection_added(&key);
        let options = Arc::new(ConnectionOptions::default());
        let timeout = options.timeout;

        Operation::with_data(
            client.clone(),
            kind,
            timeout,
            Connect {
                client,
                key,
                options,
                flags: ClientFlags::default(),
                attempts_made: 0,
                attempt_timeout: timeout,
                conn: Some(conn),
                tcp_timer: Timer::new(),
                active_in_client: true,
                context: ConnectionContext::default(),
            },
        )
    }

    pub fn key(&self) -> Arc<ConnectionKey> {
        Arc::clone(&self.lock().data.key)
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions::clone(&self.lock().data.options)
    }

    pub fn attempts_made(&self) -> u32 {
        self.lock().data.attempts_made
    }

    pub fn flags(&self) -> ClientFlags {
        self.lock().data.flags
    }

    pub fn connection_context(&self) -> ConnectionContext {
        self.lock().data.context.clone()
    }

    fn update_options(&self, f: impl FnOnce(&mut ConnectionOptions)) -> Result<()> {
        self.configure(|inner| f(Arc::make_mut(&mut inner.data.options)))
    }

    /// Replace all connection options at once
    pub fn set_connection_options(&self, options: ConnectionOptions) -> Result<()> {
        if options.connect_attempts == 0 {
            return Err(Error::BadConfigError(
                "connect_attempts must be at least 1".to_string(),
            ));
        }
        self.configure(|inner| inner.data.options = Arc::new(options))
    }

    /// Timeout of each attempt
    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        self.update_options(|o| o.timeout = timeout)
    }

    pub fn set_total_timeout(&self, timeout: Duration) -> Result<()> {
        self.update_options(|o| o.total_timeout = Some(timeout))
    }

    pub fn set_tcp_timeout(&self, timeout: Duration) -> Result<()> {
        self.update_options(|o| o.connect_tcp_timeout = timeout)
    }

    pub fn set_connect_attempts(&self, attempts: u32) -> Result<()> {
        if attempts == 0 {
            return Err(Error::BadConfigError(
                "connect_attempts must be at least 1".to_string(),
            ));
        }
        self.update_options(|o| o.connect_attempts = attempts)
    }

    /// Default timeout of queries run on the resulting connection
    pub fn set_default_query_timeout(&self, timeout: Duration) -> Result<()> {
        self.update_options(|o| o.query_timeout = Some(timeout))
    }

    pub fn set_dscp(&self, dscp: u8) -> Result<()> {
        if dscp > 63 {
            return Err(Error::BadConfigError(format!(
                "dscp must be in 0..=63, got {}",
                dscp
            )));
        }
        self.update_options(|o| o.dscp = Some(dscp))
    }

    pub fn set_attributes(&self, attributes: AttributeMap) -> Result<()> {
        self.update_options(|o| o.attributes = attributes)
    }

    pub fn add_attribute(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.update_options(|o| {
            o.attributes.insert(key.into(), value.into());
        })
    }

    pub fn set_compression(&self, compression: Option<Compression>) -> Result<()> {
        self.update_options(|o| o.compression = compression)
    }

    pub fn set_sni_server_name(&self, name: impl Into<String>) -> Result<()> {
        self.update_options(|o| o.sni_server_name = Some(name.into()))
    }

    pub fn set_ssl_options_provider(&self, provider: Arc<dyn SslOptionsProvider>) -> Result<()> {
        self.update_options(|o| o.ssl_options_provider = Some(provider))
    }

    pub fn set_cert_validation(&self, validation: CertValidation) -> Result<()> {
        self.update_options(|o| o.cert_validation = Some(validation))
    }

    pub fn set_kill_on_query_timeout(&self, kill: bool) -> Result<()> {
        self.update_options(|o| o.kill_on_query_timeout = kill)
    }

    pub fn set_reset_conn_before_close(&self, reset: bool) -> Result<()> {
        self.update_options(|o| o.reset_conn_before_close = reset)
    }

    /// Leave the reset to the pool instead of doing it in [`Connection::close`]
    pub fn set_delayed_reset_conn(&self, delayed: bool) -> Result<()> {
        self.update_options(|o| o.delayed_reset_conn = delayed)
    }

    pub fn set_change_user(&self, change_user: bool) -> Result<()> {
        self.update_options(|o| o.change_user = change_user)
    }

    pub fn set_flags(&self, flags: ClientFlags) -> Result<()> {
        self.configure(|inner| inner.data.flags = flags)
    }

    /// Take the established connection. Only possible once, after the operation succeeded.
    pub fn take_connection(&self) -> Result<Connection> {
        let mut inner = self.lock();
        if inner.base.result != OperationResult::Succeeded {
            return Err(Error::state(format!(
                "connection is only available after a successful connect (result: {})",
                inner.base.result
            )));
        }
        inner
            .data
            .conn
            .take()
            .ok_or_else(|| Error::state("connection was already taken"))
    }

    fn fail_setup(&self, errno: u32, message: impl Into<String>) {
        self.lock().base.set_error(errno, message);
        self.complete_operation(OperationResult::Failed);
    }

    /// Apply the options to the backend connection before an attempt
    fn prepare_attempt(&self) -> bool {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let data = &mut inner.data;
        let options = Arc::clone(&data.options);
        let first_attempt = data.attempts_made == 0;
        let Some(conn) = data.conn.as_mut() else {
            return false;
        };
        let internal = conn.internal_mut();

        if first_attempt {
            internal.initialize();
        } else {
            internal.reinitialize();
        }
        if !internal.has_initialized() {
            return false;
        }

        if !options.attributes.is_empty() {
            internal.set_connect_attributes(&options.attributes);
        }
        if let Some(compression) = options.compression {
            internal.set_compression(compression);
        }
        if let Some(provider) = &options.ssl_options_provider {
            data.context.is_ssl_connection = internal.set_ssl_options_provider(provider);
        }
        if let Some(sni) = &options.sni_server_name {
            internal.set_sni_server_name(sni);
        }
        if let Some(dscp) = options.dscp {
            if !internal.set_dscp(dscp) {
                warn!(key = %data.key, dscp, "failed to apply DSCP marking");
            }
        }
        if let Some(validation) = &options.cert_validation {
            internal.set_cert_validator(CertValidator {
                op: self.downgrade(),
                validation: validation.clone(),
            });
        }

        let tcp_timeout = options.connect_tcp_timeout;
        if !tcp_timeout.is_zero() && !data.key.uses_unix_socket() {
            internal.set_connect_timeout(tcp_timeout);
            let weak = self.downgrade();
            data.tcp_timer.schedule(self.event_loop(), tcp_timeout, move || {
                if let Some(op) = Operation::upgrade(&weak) {
                    op.tcp_timeout_fired();
                }
            });
        }
        true
    }

    fn tcp_timeout_fired(&self) {
        {
            let inner = self.lock();
            if inner.base.state != OperationState::Pending {
                return;
            }
            let handshake_done = inner
                .data
                .conn
                .as_ref()
                .is_some_and(|c| c.internal().is_done_with_tcp_handshake());
            if handshake_done {
                return;
            }
        }
        self.timeout_handler(true);
    }

    fn timeout_handler(&self, tcp_timeout: bool) {
        {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let pooled = inner.base.kind == OperationKind::PooledConnect;
            let stage = match (&inner.data.conn, pooled) {
                (Some(conn), false) => Some(conn.internal().connect_stage_name()),
                _ => None,
            };
            let message = ConnectTimeoutMessage {
                pooled,
                host: &inner.data.key.host,
                port: inner.data.key.port,
                stage: stage.as_deref(),
                elapsed: inner.base.elapsed(),
                timeout: if tcp_timeout {
                    inner.data.options.connect_tcp_timeout
                } else {
                    inner.data.attempt_timeout
                },
                callback_delay: self.client().callback_delay_avg(),
                tcp_timeout,
            }
            .to_string();
            inner.base.set_error(client_errno::CR_SERVER_LOST, message);
        }
        self.attempt_failed(OperationResult::TimedOut);
    }

    fn attempt_succeeded(&self) {
        self.lock().data.attempts_made += 1;
        self.complete_operation(OperationResult::Succeeded);
    }

    /// Retry if attempts and time remain, otherwise complete with `result`
    fn attempt_failed(&self, result: OperationResult) {
        {
            let mut guard = self.lock();
            let inner = &mut *guard;
            if inner.base.state != OperationState::Pending {
                return;
            }
            inner.data.attempts_made += 1;
            let elapsed = inner.base.elapsed();
            let total = inner.data.options.effective_total_timeout();
            let out_of_attempts = inner.data.attempts_made >= inner.data.options.connect_attempts;
            let cancelled = result == OperationResult::Cancelled || inner.base.cancel_requested;
            let remaining = total.saturating_sub(elapsed);
            if out_of_attempts
                || cancelled
                || elapsed > total + TOTAL_TIMEOUT_SLACK
                || remaining.is_zero()
            {
                drop(guard);
                self.complete_operation(result);
                return;
            }

            self.client().log_connect_attempt(&ConnectAttemptRecord {
                kind: inner.base.kind,
                key: &inner.data.key,
                result,
                elapsed,
                timeout: inner.data.attempt_timeout,
                attempt: inner.data.attempts_made,
                errno: inner.base.errno,
                message: &inner.base.error_message,
            });

            inner.data.tcp_timer.cancel();
            inner.base.stop_waiting();
            if let Some(conn) = inner.data.conn.as_mut() {
                conn.internal_mut().close();
            }
            let next_timeout = inner.data.options.timeout.min(remaining);
            inner.data.attempt_timeout = next_timeout;
            self.schedule_timeout(inner, next_timeout);
            debug!(
                key = %inner.data.key,
                attempt = inner.data.attempts_made + 1,
                timeout_ms = next_timeout.as_millis(),
                "retrying connect"
            );
        }
        Connect::specialized_run(self);
    }
}

impl OperationImpl for Connect {
    fn prepare_run(inner: &mut Inner<Self>) {
        let options = &inner.data.options;
        let timeout = options.timeout.min(options.effective_total_timeout());
        inner.data.attempt_timeout = timeout;
        inner.base.timeout = timeout;
    }

    #[instrument(skip_all)]
    fn specialized_run(op: &Operation<Self>) {
        if !op.prepare_attempt() {
            op.fail_setup(
                ClientErrno::InitializationFailed.code(),
                format!("({})Failed to initialize the connection", ERROR_PREFIX),
            );
            return;
        }
        Self::actionable(op);
    }

    fn actionable(op: &Operation<Self>) {
        let (mut conn, options, key, flags) = {
            let mut inner = op.lock();
            if inner.base.state != OperationState::Pending {
                return;
            }
            if inner.base.cancel_requested {
                drop(inner);
                op.attempt_failed(OperationResult::Cancelled);
                return;
            }
            let Some(conn) = inner.data.conn.take() else {
                drop(inner);
                op.fail_setup(
                    client_errno::CR_UNKNOWN_ERROR,
                    Error::bug("connect step without a connection").to_string(),
                );
                return;
            };
            (
                conn,
                Arc::clone(&inner.data.options),
                Arc::clone(&inner.data.key),
                inner.data.flags,
            )
        };

        // The connection stays out of the lock while the backend runs: a certificate validator
        // may call back into this operation.
        let handler = op.client().shared_handler();
        let status = handler.try_connect(conn.internal_mut(), &options, &key, flags);

        let mut guard = op.lock();
        let inner = &mut *guard;
        let internal = conn.internal();
        let handshake_done = internal.is_done_with_tcp_handshake();
        let has_socket = internal.socket_descriptor().is_some_and(|fd| fd > 0);
        let ready = (status == Status::Pending && has_socket).then(|| internal.wait_ready());
        let backend_error = (status == Status::Error)
            .then(|| (internal.errno(), internal.error_message()));
        inner.data.conn = Some(conn);

        if inner.base.state != OperationState::Pending {
            if let Some(conn) = inner.data.conn.as_mut() {
                if inner.base.result != OperationResult::Succeeded {
                    conn.internal_mut().close();
                }
            }
            return;
        }
        if handshake_done {
            inner.data.tcp_timer.cancel();
        }

        if let Some((errno, message)) = backend_error {
            inner.base.set_error(errno, message);
            drop(guard);
            op.attempt_failed(OperationResult::Failed);
        } else if !has_socket {
            error!(key = %key, ?status, "backend reported no valid socket descriptor");
            inner.base.set_error(
                ClientErrno::InitializationFailed.code(),
                "backend returned an invalid socket descriptor",
            );
            drop(guard);
            op.attempt_failed(OperationResult::Failed);
        } else if let Some(ready) = ready {
            op.wait_for_actionable(inner, ready);
        } else {
            drop(guard);
            op.attempt_succeeded();
        }
    }

    fn timeout_triggered(op: &Operation<Self>) {
        op.timeout_handler(false);
    }

    fn ready_failed(op: &Operation<Self>, err: io::Error) {
        op.lock()
            .base
            .set_error(client_errno::CR_SERVER_LOST, format!("socket wait failed: {}", err));
        op.attempt_failed(OperationResult::Failed);
    }

    fn specialized_complete(op: &Operation<Self>, inner: &mut Inner<Self>) {
        let result = inner.base.result;
        let data = &mut inner.data;
        data.tcp_timer.cancel();

        if result == OperationResult::Succeeded {
            if inner.base.kind == OperationKind::Connect {
                data.maybe_store_ssl_session();
            }
            if let Some(conn) = data.conn.as_ref() {
                data.context.endpoint_version = conn.internal().server_info();
                data.context.ssl_version = conn.internal().tls_version();
            }
        }

        if let Some(conn) = data.conn.as_mut() {
            if conn.internal().has_initialized() {
                op.client().log_connect_attempt(&ConnectAttemptRecord {
                    kind: inner.base.kind,
                    key: &data.key,
                    result,
                    elapsed: inner.base.elapsed(),
                    timeout: data.attempt_timeout,
                    attempt: data.attempts_made,
                    errno: inner.base.errno,
                    message: &inner.base.error_message,
                });
            }
            if result != OperationResult::Succeeded {
                conn.internal_mut().close();
            }
            conn.set_options(ConnectionOptions::clone(&data.options));
            conn.set_context(data.context.clone());
        }

        data.remove_client_reference();
    }
}

/// Timeout error text, e.g.
/// `[7000](Mysql Client)Connect to db1:3306 timed out at stage connecting (took 1002ms, timeout was 1000ms) (TcpTimeout:0)`
struct ConnectTimeoutMessage<'a> {
    pooled: bool,
    host: &'a str,
    port: u16,
    stage: Option<&'a str>,
    elapsed: Duration,
    timeout: Duration,
    callback_delay: Duration,
    tcp_timeout: bool,
}

impl fmt::Display for ConnectTimeoutMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stalled = self.callback_delay >= CALLBACK_DELAY_STALL_THRESHOLD;
        let errno = if stalled {
            ClientErrno::ConnTimeoutLoopStalled
        } else {
            ClientErrno::ConnTimeout
        };
        write!(
            f,
            "[{}]({})Connect{} to {}:{} timed out",
            errno.code(),
            ERROR_PREFIX,
            if self.pooled { "Pool" } else { "" },
            self.host,
            self.port
        )?;
        if let Some(stage) = self.stage {
            write!(f, " at stage {}", stage)?;
        }
        write!(
            f,
            " (took {}ms, timeout was {}ms)",
            self.elapsed.as_millis(),
            self.timeout.as_millis()
        )?;
        if stalled {
            write!(
                f,
                " (CLIENT_OVERLOADED: cb delay {}ms)",
                self.callback_delay.as_millis()
            )?;
        }
        write!(f, " (TcpTimeout:{})", u8::from(self.tcp_timeout))
    }
}

/// Certificate validation hook handed to the backend
///
/// Holds the operation weakly. If the operation is gone by the time the backend validates the
/// server certificate, the certificate is rejected.
#[derive(Clone)]
pub struct CertValidator {
    op: Weak<Shared<Connect>>,
    validation: CertValidation,
}

impl CertValidator {
    /// Validate `server_cert` (DER). `Err` carries the rejection message.
    pub fn validate(&self, server_cert: &[u8]) -> std::result::Result<(), String> {
        let Some(op) = Operation::upgrade(&self.op) else {
            error!("connect operation is already deallocated, rejecting server certificate");
            return Err("connect operation no longer exists".to_string());
        };
        let context = if self.validation.op_as_context {
            CertValidationContext::Operation(&op)
        } else if let Some(context) = &self.validation.context {
            CertValidationContext::User(context.as_ref())
        } else {
            CertValidationContext::None
        };
        (self.validation.callback)(server_cert, context)
    }
}

impl fmt::Debug for CertValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertValidator")
            .field("validation", &self.validation)
            .finish_non_exhaustive()
    }
}
