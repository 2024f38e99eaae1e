use std::io;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};

use super::row_stream::Slurp;
use super::{
    Inner, Operation, OperationBase, OperationImpl, OperationKind, OperationResult,
    OperationState, RowStream,
};
use crate::connection::Connection;
use crate::constant::{
    CALLBACK_DELAY_STALL_THRESHOLD, ClientErrno, ERROR_PREFIX, ServerStatusFlags, client_errno,
};
use crate::error::{Error, Result};
use crate::handler::{ReadyFuture, Status};
use crate::opts::AttributeMap;
use crate::query::MultiQuery;

/// Runs one or more statements and delivers their results to a [`FetchConsumer`]
pub type FetchOperation = Operation<Fetch>;

/// Step the fetch state machine performs next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchAction {
    /// Send the statements, or advance to the next result
    StartQuery,
    /// Open the result set of the current statement
    InitFetch,
    /// Pull rows of the current result set
    Fetch,
    /// Paused until the consumer calls `resume`
    WaitForConsumer,
    /// The current statement failed or was cancelled
    CompleteQuery,
    CompleteOperation,
}

/// Receives the progress of a [`FetchOperation`]
///
/// Hooks run on the event loop thread, without any operation lock held, so they may call the
/// operation's accessors, [`FetchOperation::with_row_stream`] and
/// [`FetchOperation::pause_for_consumer`].
pub trait FetchConsumer: Send + Sync {
    /// A statement finished executing and its result set (possibly empty) is about to be read
    fn notify_init_query(&self, _op: &FetchOperation) {}

    /// Rows can be consumed from the row stream
    fn notify_rows_ready(&self, op: &FetchOperation);

    /// The current statement completed; `more_results` tells whether another one follows
    fn notify_query_success(&self, _op: &FetchOperation, _more_results: bool) {}

    fn notify_failure(&self, _op: &FetchOperation, _result: OperationResult) {}

    /// Last notification, after the operation became terminal
    fn notify_operation_completed(&self, _op: &FetchOperation, _result: OperationResult) {}
}

/// Fetch-specific state of a [`FetchOperation`]
pub struct Fetch {
    queries: MultiQuery,
    rendered_query: Arc<str>,
    conn: Option<Connection>,
    consumer: Arc<dyn FetchConsumer>,
    row_stream: Option<RowStream>,
    query_executed: bool,
    /// A start step returned pending and must be re-invoked
    start_in_progress: bool,
    no_index_used: bool,
    use_checksum: bool,
    was_slow: bool,
    num_queries_executed: usize,
    num_current_query: usize,
    total_result_size: u64,
    rows_received: u64,
    current_affected_rows: u64,
    current_last_insert_id: u64,
    current_recv_gtid: Option<String>,
    current_resp_attrs: AttributeMap,
    cancel: bool,
    active_action: FetchAction,
    paused_action: FetchAction,
    in_notify: bool,
}

#[derive(Debug, Clone, Copy)]
enum Notification {
    InitQuery,
    RowsReady,
    QuerySuccess { more_results: bool },
    Failure(OperationResult),
    OperationCompleted(OperationResult),
}

enum Step {
    Continue,
    Suspend,
    Notify(Notification),
    Complete(OperationResult),
}

impl Operation<Fetch> {
    pub(crate) fn new(
        conn: Connection,
        queries: MultiQuery,
        consumer: Arc<dyn FetchConsumer>,
        kind: OperationKind,
    ) -> Self {
        let client = conn.client().clone();
        let timeout = conn.options().query_timeout.unwrap_or(Duration::ZERO);
        let rendered_query: Arc<str> = Arc::from(queries.render_multi());

        Operation::with_data(
            client,
            kind,
            timeout,
            Fetch {
                queries,
                rendered_query,
                conn: Some(conn),
                consumer,
                row_stream: None,
                query_executed: false,
                start_in_progress: false,
                no_index_used: false,
                use_checksum: false,
                was_slow: false,
                num_queries_executed: 0,
                num_current_query: 0,
                total_result_size: 0,
                rows_received: 0,
                current_affected_rows: 0,
                current_last_insert_id: 0,
                current_recv_gtid: None,
                current_resp_attrs: AttributeMap::new(),
                cancel: false,
                active_action: FetchAction::StartQuery,
                paused_action: FetchAction::StartQuery,
                in_notify: false,
            },
        )
    }

    /// Timeout of the whole fetch. Zero disables it.
    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        self.configure(|inner| inner.base.timeout = timeout)
    }

    /// Ask the backend to checksum result sets. Passed to the connection when the fetch starts.
    pub fn set_use_checksum(&self, use_checksum: bool) -> Result<()> {
        self.configure(|inner| inner.data.use_checksum = use_checksum)
    }

    pub fn use_checksum(&self) -> bool {
        self.lock().data.use_checksum
    }

    /// The text sent to the server
    pub fn rendered_query(&self) -> Arc<str> {
        Arc::clone(&self.lock().data.rendered_query)
    }

    pub fn num_queries(&self) -> usize {
        self.lock().data.queries.len()
    }

    /// Number of statements that completed successfully. Not available while pending.
    pub fn num_queries_executed(&self) -> Result<usize> {
        let inner = self.lock();
        if inner.base.state == OperationState::Pending {
            return Err(Error::state(
                "num_queries_executed() is not available while the operation is pending",
            ));
        }
        Ok(inner.data.num_queries_executed)
    }

    /// Best-effort payload size of all rows fetched so far, excluding protocol overhead
    pub fn result_size(&self) -> Result<u64> {
        let inner = self.lock();
        if inner.base.state == OperationState::Unstarted {
            return Err(Error::state("result_size() is not available before run()"));
        }
        Ok(inner.data.total_result_size)
    }

    /// Index of the statement being processed
    pub fn num_current_query(&self) -> usize {
        self.lock().data.num_current_query
    }

    pub fn rows_received(&self) -> u64 {
        self.lock().data.rows_received
    }

    pub fn no_index_used(&self) -> bool {
        self.lock().data.no_index_used
    }

    pub fn was_slow(&self) -> bool {
        self.lock().data.was_slow
    }

    pub fn current_affected_rows(&self) -> u64 {
        self.lock().data.current_affected_rows
    }

    pub fn current_last_insert_id(&self) -> u64 {
        self.lock().data.current_last_insert_id
    }

    pub fn current_recv_gtid(&self) -> Option<String> {
        self.lock().data.current_recv_gtid.clone()
    }

    pub fn current_resp_attrs(&self) -> AttributeMap {
        self.lock().data.current_resp_attrs.clone()
    }

    pub fn active_action(&self) -> FetchAction {
        self.lock().data.active_action
    }

    /// Run `f` on the current row stream
    ///
    /// Allowed from a notification callback on the loop thread, or from any thread while the
    /// operation is paused. `f` runs with the operation locked and must not call back into it.
    pub fn with_row_stream<R>(&self, f: impl FnOnce(&mut RowStream) -> R) -> Result<R> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.base.state != OperationState::Pending {
            return Err(Error::StreamAccessError(format!(
                "operation is not running (state: {:?})",
                inner.base.state
            )));
        }
        let in_callback = inner.data.in_notify && self.event_loop().is_in_loop_thread();
        let paused = inner.data.active_action == FetchAction::WaitForConsumer;
        if !in_callback && !paused {
            return Err(Error::StreamAccessError(
                "row stream is only accessible from a notification callback or while paused"
                    .to_string(),
            ));
        }
        let stream = inner
            .data
            .row_stream
            .as_mut()
            .ok_or_else(|| Error::StreamAccessError("no result set is open".to_string()))?;
        Ok(f(stream))
    }

    /// Stop fetching after the current notification until [`FetchOperation::resume`]
    pub fn pause_for_consumer(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.base.state != OperationState::Pending
            || !inner.data.in_notify
            || !self.event_loop().is_in_loop_thread()
        {
            return Err(Error::state(
                "pause_for_consumer() may only be called from a notification callback",
            ));
        }
        if inner.data.active_action != FetchAction::WaitForConsumer {
            inner.data.paused_action = inner.data.active_action;
            inner.data.active_action = FetchAction::WaitForConsumer;
        }
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.lock().data.active_action == FetchAction::WaitForConsumer
    }

    /// Continue a paused fetch. Callable from any thread.
    pub fn resume(&self) -> Result<()> {
        {
            let inner = self.lock();
            if inner.base.state != OperationState::Pending
                || inner.data.active_action != FetchAction::WaitForConsumer
            {
                return Err(Error::state("resume() called on an operation that is not paused"));
            }
        }
        let op = self.clone();
        if let Err(e) = self.event_loop().run_in_thread(move || op.resume_in_loop()) {
            self.lock()
                .base
                .set_error(client_errno::CR_UNKNOWN_ERROR, e.to_string());
            self.complete_operation(OperationResult::Failed);
            return Err(e);
        }
        Ok(())
    }

    fn resume_in_loop(&self) {
        {
            let mut inner = self.lock();
            if inner.base.state != OperationState::Pending
                || inner.data.active_action != FetchAction::WaitForConsumer
            {
                return;
            }
            inner.data.active_action = inner.data.paused_action;
        }
        Fetch::actionable(self);
    }

    /// Hand the connection back. Only possible once the operation is terminal.
    pub fn take_connection(&self) -> Result<Connection> {
        let mut inner = self.lock();
        if !inner.base.state.is_terminal() {
            return Err(Error::state(
                "connection is only available after the operation completed",
            ));
        }
        inner
            .data
            .conn
            .take()
            .ok_or_else(|| Error::state("connection was already taken"))
    }

    fn notify(&self, notification: Notification) {
        let consumer = {
            let mut inner = self.lock();
            inner.data.in_notify = true;
            Arc::clone(&inner.data.consumer)
        };
        match notification {
            Notification::InitQuery => consumer.notify_init_query(self),
            Notification::RowsReady => consumer.notify_rows_ready(self),
            Notification::QuerySuccess { more_results } => {
                consumer.notify_query_success(self, more_results)
            }
            Notification::Failure(result) => consumer.notify_failure(self, result),
            Notification::OperationCompleted(result) => {
                consumer.notify_operation_completed(self, result)
            }
        }
        self.lock().data.in_notify = false;
    }

    /// Fire-and-forget kill of the statement running on the connection
    fn kill_running_query(&self, data: &Fetch) {
        if !(data.query_executed || data.start_in_progress) {
            return;
        }
        if let Some(conn) = data.conn.as_ref() {
            info!(key = %conn.key(), connection_id = conn.connection_id(), "killing running query");
            self.client()
                .kill_query(conn.shared_key(), conn.connection_id());
        }
    }

    /// Run `f` on the connection with the operation unlocked. `None` if it is not here.
    fn with_connection<R>(&self, f: impl FnOnce(&mut Connection) -> R) -> Option<R> {
        let mut conn = self.lock().data.conn.take()?;
        let out = f(&mut conn);
        self.lock().data.conn = Some(conn);
        Some(out)
    }

    fn step(&self) -> Step {
        let action = {
            let mut inner = self.lock();
            if inner.base.state != OperationState::Pending {
                return Step::Suspend;
            }
            if inner.base.cancel_requested && !inner.data.cancel {
                inner.data.cancel = true;
                inner.data.active_action = FetchAction::CompleteQuery;
            }
            inner.data.active_action
        };

        match action {
            FetchAction::StartQuery => self.start_query(),
            FetchAction::InitFetch => self.init_fetch(),
            FetchAction::Fetch => self.fetch_rows(),
            FetchAction::WaitForConsumer => Step::Suspend,
            FetchAction::CompleteQuery => {
                let mut inner = self.lock();
                inner.data.row_stream = None;
                if inner.data.cancel {
                    self.kill_running_query(&inner.data);
                    Step::Complete(OperationResult::Cancelled)
                } else {
                    Step::Complete(OperationResult::Failed)
                }
            }
            FetchAction::CompleteOperation => Step::Complete(OperationResult::Succeeded),
        }
    }

    fn start_query(&self) -> Step {
        let (query, next) = {
            let mut inner = self.lock();
            let data = &mut inner.data;
            if !data.start_in_progress && data.query_executed {
                data.num_current_query += 1;
            }
            data.start_in_progress = true;
            data.row_stream = None;
            (Arc::clone(&data.rendered_query), data.query_executed)
        };

        let handler = self.client().handler();
        let progress = self.with_connection(|conn| {
            let status = if next {
                handler.next_result(conn.internal_mut())
            } else {
                handler.run_query(conn.internal_mut(), &query)
            };
            Progress::of(status, conn)
        });

        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.base.state != OperationState::Pending {
            return Step::Suspend;
        }
        let Some(progress) = progress else {
            return missing_connection(&mut inner.base);
        };
        match progress {
            Progress::Wait(ready) => {
                self.wait_for_actionable(inner, ready);
                return Step::Suspend;
            }
            Progress::Failed(errno, message) => {
                inner.data.active_action = FetchAction::CompleteQuery;
                inner.base.set_error(errno, message);
            }
            Progress::Done => inner.data.active_action = FetchAction::InitFetch,
        }
        inner.data.start_in_progress = false;
        inner.data.query_executed = true;
        Step::Continue
    }

    fn init_fetch(&self) -> Step {
        let handler = self.client().handler();
        let opened = self.with_connection(|conn| {
            if handler.field_count(conn.internal()) == 0 {
                return Ok(None);
            }
            handler.get_result(conn.internal_mut()).map(Some).ok_or_else(|| {
                let internal = conn.internal();
                (internal.errno(), internal.error_message())
            })
        });

        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.base.state != OperationState::Pending {
            return Step::Suspend;
        }
        let data = &mut inner.data;
        match opened {
            None => missing_connection(&mut inner.base),
            Some(Err((errno, message))) => {
                data.active_action = FetchAction::CompleteQuery;
                inner.base.set_error(errno, message);
                Step::Continue
            }
            Some(Ok(result)) => {
                data.row_stream = Some(RowStream::new(result, self.client().shared_handler()));
                data.current_affected_rows = 0;
                data.current_last_insert_id = 0;
                data.current_recv_gtid = None;
                data.current_resp_attrs.clear();
                data.active_action = FetchAction::Fetch;
                Step::Notify(Notification::InitQuery)
            }
        }
    }

    fn fetch_rows(&self) -> Step {
        let (conn, mut stream) = {
            let mut inner = self.lock();
            match (inner.data.conn.take(), inner.data.row_stream.take()) {
                (Some(conn), Some(stream)) => (conn, stream),
                (conn, stream) => {
                    inner.data.conn = conn;
                    inner.data.row_stream = stream;
                    return missing_connection(&mut inner.base);
                }
            }
        };

        let slurp = stream.slurp();
        let internal = conn.internal();
        let outcome = match slurp {
            Slurp::Row => Slurped::Row,
            Slurp::Pending => Slurped::Wait(internal.wait_ready()),
            Slurp::Error => Slurped::Failed(internal.errno(), internal.error_message()),
            Slurp::Finished => Slurped::Finished(Trailer {
                affected_rows: internal.affected_rows(),
                last_insert_id: internal.last_insert_id(),
                recv_gtid: internal.recv_gtid(),
                resp_attrs: internal.response_attributes(),
                status: internal.server_status(),
                more_results: internal.more_results(),
            }),
        };

        let mut guard = self.lock();
        let inner = &mut *guard;
        let data = &mut inner.data;
        data.conn = Some(conn);
        if inner.base.state != OperationState::Pending {
            return Step::Suspend;
        }
        match outcome {
            Slurped::Row => {
                data.row_stream = Some(stream);
                Step::Notify(Notification::RowsReady)
            }
            Slurped::Wait(ready) => {
                data.row_stream = Some(stream);
                self.wait_for_actionable(inner, ready);
                Step::Suspend
            }
            Slurped::Failed(errno, message) => {
                data.active_action = FetchAction::CompleteQuery;
                inner.base.set_error(errno, message);
                Step::Continue
            }
            Slurped::Finished(trailer) => {
                data.total_result_size += stream.query_result_size();
                data.rows_received += stream.num_rows_seen();
                data.row_stream = Some(stream);
                data.current_affected_rows = trailer.affected_rows;
                data.current_last_insert_id = trailer.last_insert_id;
                data.current_recv_gtid = trailer.recv_gtid;
                data.current_resp_attrs = trailer.resp_attrs;
                data.no_index_used |= trailer
                    .status
                    .contains(ServerStatusFlags::SERVER_STATUS_NO_INDEX_USED);
                data.was_slow |= trailer
                    .status
                    .contains(ServerStatusFlags::SERVER_QUERY_WAS_SLOW);
                data.num_queries_executed += 1;
                let more_results = trailer.more_results;
                data.active_action = if more_results {
                    FetchAction::StartQuery
                } else {
                    FetchAction::CompleteOperation
                };
                Step::Notify(Notification::QuerySuccess { more_results })
            }
        }
    }
}

/// Outcome of a statement start, read off the connection before relocking
enum Progress {
    Done,
    Wait(ReadyFuture),
    Failed(u32, String),
}

impl Progress {
    fn of(status: Status, conn: &Connection) -> Self {
        let internal = conn.internal();
        match status {
            Status::Done => Self::Done,
            Status::Pending => Self::Wait(internal.wait_ready()),
            Status::Error => Self::Failed(internal.errno(), internal.error_message()),
        }
    }
}

enum Slurped {
    Row,
    Wait(ReadyFuture),
    Failed(u32, String),
    Finished(Trailer),
}

/// Per-statement metadata captured once its rows are exhausted
struct Trailer {
    affected_rows: u64,
    last_insert_id: u64,
    recv_gtid: Option<String>,
    resp_attrs: AttributeMap,
    status: ServerStatusFlags,
    more_results: bool,
}

fn missing_connection(base: &mut OperationBase) -> Step {
    base.set_error(
        client_errno::CR_UNKNOWN_ERROR,
        Error::bug("fetch step without a connection or result set").to_string(),
    );
    Step::Complete(OperationResult::Failed)
}

impl OperationImpl for Fetch {
    #[instrument(skip_all)]
    fn specialized_run(op: &Operation<Self>) {
        {
            let mut inner = op.lock();
            if inner.data.queries.is_empty() {
                inner
                    .base
                    .set_error(client_errno::CR_UNKNOWN_ERROR, "no statements to run");
                drop(inner);
                op.complete_operation(OperationResult::Failed);
                return;
            }
            debug!(query = %inner.data.rendered_query, "starting fetch");
        }
        let use_checksum = op.lock().data.use_checksum;
        op.with_connection(|conn| conn.internal_mut().set_use_checksum(use_checksum));
        Self::actionable(op);
    }

    fn actionable(op: &Operation<Self>) {
        loop {
            match op.step() {
                Step::Continue => {}
                Step::Suspend => return,
                Step::Notify(notification) => op.notify(notification),
                Step::Complete(result) => {
                    op.complete_operation(result);
                    return;
                }
            }
        }
    }

    fn timeout_triggered(op: &Operation<Self>) {
        {
            let mut guard = op.lock();
            let inner = &mut *guard;
            let callback_delay = op.client().callback_delay_avg();
            let stalled = callback_delay >= CALLBACK_DELAY_STALL_THRESHOLD;
            let errno = if stalled {
                ClientErrno::QueryTimeoutLoopStalled
            } else {
                ClientErrno::QueryTimeout
            };
            let mut message = format!(
                "[{}]({})Query timed out (took {}ms, timeout was {}ms)",
                errno.code(),
                ERROR_PREFIX,
                inner.base.elapsed().as_millis(),
                inner.base.timeout.as_millis()
            );
            if stalled {
                message.push_str(&format!(
                    " (CLIENT_OVERLOADED: cb delay {}ms)",
                    callback_delay.as_millis()
                ));
            }
            inner
                .base
                .set_error(client_errno::ER_NET_READ_INTERRUPTED, message);
            inner.data.row_stream = None;
            let kill = inner
                .data
                .conn
                .as_ref()
                .is_some_and(Connection::kill_on_query_timeout);
            if kill {
                op.kill_running_query(&inner.data);
            }
        }
        op.complete_operation(OperationResult::TimedOut);
    }

    fn ready_failed(op: &Operation<Self>, err: io::Error) {
        {
            let mut inner = op.lock();
            inner
                .base
                .set_error(client_errno::CR_SERVER_LOST, format!("socket wait failed: {}", err));
            inner.data.active_action = FetchAction::CompleteQuery;
        }
        Self::actionable(op);
    }

    fn specialized_complete(_op: &Operation<Self>, inner: &mut Inner<Self>) {
        inner.data.row_stream = None;
        inner.data.start_in_progress = false;
    }

    fn after_complete(op: &Operation<Self>, result: OperationResult) {
        if result != OperationResult::Succeeded {
            op.notify(Notification::Failure(result));
        }
        op.notify(Notification::OperationCompleted(result));
    }
}
