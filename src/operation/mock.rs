//! Scripted backend for driving operations in tests

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::client::Client;
use crate::constant::{ClientFlags, Compression, ServerStatusFlags};
use crate::error::Result;
use crate::handler::{
    ConnectionFactory, FetchRow, InternalConnection, InternalResult, NonBlockingHandler,
    ProtocolHandler, ReadyFuture, Status,
};
use crate::operation::{CertValidator, ConnectOperation};
use crate::opts::{AttributeMap, ConnectionKey, ConnectionOptions, SslOptionsProvider};
use crate::row::{Row, RowFields};

pub(crate) const MOCK_CONNECTION_ID: u64 = 4711;
pub(crate) const CR_SSL_CONNECTION_ERROR: u32 = 2026;

/// One statement's scripted outcome
#[derive(Debug, Clone, Default)]
pub(crate) struct MockQuery {
    pub columns: Vec<String>,
    /// `None` is a statement without a result set
    pub rows: Option<Vec<FetchRow>>,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: ServerStatusFlags,
    pub error: Option<(u32, String)>,
}

impl MockQuery {
    pub fn select(columns: &[&str], rows: Vec<Vec<&str>>) -> Self {
        Self {
            columns: columns.iter().map(ToString::to_string).collect(),
            rows: Some(
                rows.into_iter()
                    .map(|r| FetchRow::Row(Row::from(&r[..])))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    pub fn insert(affected_rows: u64, last_insert_id: u64) -> Self {
        Self {
            affected_rows,
            last_insert_id,
            ..Default::default()
        }
    }

    pub fn failing(errno: u32, message: &str) -> Self {
        Self {
            error: Some((errno, message.to_string())),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    Immediate,
    Never,
}

pub(crate) struct MockState {
    /// Popped per connect step; `default_connect` once empty
    pub connect_steps: VecDeque<Status>,
    pub default_connect: Status,
    pub connect_error: (u32, String),
    pub readiness: Readiness,
    pub handshake_done: bool,
    pub has_socket: bool,
    pub server_cert: Option<Vec<u8>>,
    pub store_session_result: bool,

    /// Statements returned in order by `run_query` and `next_result`
    pub queries: VecDeque<MockQuery>,
    /// Number of pending answers before a statement starts
    pub start_pending: usize,
    pub query_pending_forever: bool,

    pub connect_calls: usize,
    pub initialize_calls: usize,
    pub reinitialize_calls: usize,
    pub close_calls: usize,
    pub reset_calls: usize,
    pub changed_users: Vec<String>,
    pub run_query_texts: Vec<String>,
    pub next_result_calls: usize,
    pub use_checksum: Option<bool>,
    pub attributes: AttributeMap,
    pub compression: Option<Compression>,
    pub dscp: Option<u8>,
    pub sni: Option<String>,
    pub validator: Option<CertValidator>,
    pub kills: Vec<(ConnectionKey, u64)>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            connect_steps: VecDeque::new(),
            default_connect: Status::Done,
            connect_error: (1045, "Access denied for user".to_string()),
            readiness: Readiness::Immediate,
            handshake_done: true,
            has_socket: true,
            server_cert: None,
            store_session_result: true,
            queries: VecDeque::new(),
            start_pending: 0,
            query_pending_forever: false,
            connect_calls: 0,
            initialize_calls: 0,
            reinitialize_calls: 0,
            close_calls: 0,
            reset_calls: 0,
            changed_users: Vec::new(),
            run_query_texts: Vec::new(),
            next_result_calls: 0,
            use_checksum: None,
            attributes: AttributeMap::new(),
            compression: None,
            dscp: None,
            sni: None,
            validator: None,
            kills: Vec::new(),
        }
    }
}

pub(crate) type SharedState = Arc<Mutex<MockState>>;

pub(crate) struct MockConnection {
    state: SharedState,
    initialized: bool,
    current: Option<MockQuery>,
    errno: u32,
    error: String,
}

impl MockConnection {
    fn fail(&mut self, errno: u32, message: String) -> Status {
        self.errno = errno;
        self.error = message;
        Status::Error
    }

    fn start_statement(&mut self) -> Status {
        let next = {
            let mut state = self.state.lock();
            if state.query_pending_forever {
                return Status::Pending;
            }
            if state.start_pending > 0 {
                state.start_pending -= 1;
                return Status::Pending;
            }
            state.queries.pop_front()
        };
        let Some(query) = next else {
            return self.fail(2014, "Commands out of sync".to_string());
        };
        if let Some((errno, message)) = query.error.clone() {
            self.current = None;
            return self.fail(errno, message);
        }
        self.current = Some(query);
        Status::Done
    }
}

impl InternalConnection for MockConnection {
    fn initialize(&mut self) {
        self.initialized = true;
        self.state.lock().initialize_calls += 1;
    }

    fn reinitialize(&mut self) {
        self.state.lock().reinitialize_calls += 1;
    }

    fn has_initialized(&self) -> bool {
        self.initialized
    }

    fn close(&mut self) {
        self.state.lock().close_calls += 1;
    }

    fn socket_descriptor(&self) -> Option<RawFd> {
        self.state.lock().has_socket.then_some(3)
    }

    fn wait_ready(&self) -> ReadyFuture {
        match self.state.lock().readiness {
            Readiness::Immediate => Box::pin(async {
                tokio::task::yield_now().await;
                Ok(())
            }),
            Readiness::Never => Box::pin(std::future::pending()),
        }
    }

    fn is_done_with_tcp_handshake(&self) -> bool {
        self.state.lock().handshake_done
    }

    fn connect_stage_name(&self) -> String {
        String::from("sending auth")
    }

    fn errno(&self) -> u32 {
        self.errno
    }

    fn error_message(&self) -> String {
        self.error.clone()
    }

    fn server_info(&self) -> Option<String> {
        Some(String::from("8.0.mock"))
    }

    fn tls_version(&self) -> Option<String> {
        Some(String::from("TLSv1.3"))
    }

    fn connection_id(&self) -> u64 {
        MOCK_CONNECTION_ID
    }

    fn set_connect_attributes(&mut self, attributes: &AttributeMap) {
        self.state.lock().attributes = attributes.clone();
    }

    fn set_compression(&mut self, compression: Compression) {
        self.state.lock().compression = Some(compression);
    }

    fn set_ssl_options_provider(&mut self, _provider: &Arc<dyn SslOptionsProvider>) -> bool {
        true
    }

    fn set_sni_server_name(&mut self, name: &str) {
        self.state.lock().sni = Some(name.to_string());
    }

    fn set_dscp(&mut self, dscp: u8) -> bool {
        self.state.lock().dscp = Some(dscp);
        true
    }

    fn set_cert_validator(&mut self, validator: CertValidator) {
        self.state.lock().validator = Some(validator);
    }

    fn store_session(&mut self, provider: &Arc<dyn SslOptionsProvider>) -> bool {
        let accepted = self.state.lock().store_session_result;
        accepted && provider.store_session(b"session".to_vec())
    }

    fn try_connect(
        &mut self,
        _key: &ConnectionKey,
        _opts: &ConnectionOptions,
        _flags: ClientFlags,
    ) -> Status {
        let (status, validation) = {
            let mut state = self.state.lock();
            state.connect_calls += 1;
            let status = state
                .connect_steps
                .pop_front()
                .unwrap_or(state.default_connect);
            let validation = state.validator.clone().zip(state.server_cert.clone());
            (status, validation)
        };
        match status {
            Status::Done => {
                if let Some((validator, cert)) = validation {
                    if let Err(message) = validator.validate(&cert) {
                        return self.fail(CR_SSL_CONNECTION_ERROR, message);
                    }
                }
                Status::Done
            }
            Status::Error => {
                let (errno, message) = self.state.lock().connect_error.clone();
                self.fail(errno, message)
            }
            Status::Pending => Status::Pending,
        }
    }

    fn run_query(&mut self, query: &str) -> Status {
        self.state.lock().run_query_texts.push(query.to_string());
        self.start_statement()
    }

    fn next_result(&mut self) -> Status {
        self.state.lock().next_result_calls += 1;
        self.start_statement()
    }

    fn more_results(&self) -> bool {
        !self.state.lock().queries.is_empty()
    }

    fn field_count(&self) -> usize {
        match &self.current {
            Some(MockQuery {
                rows: Some(_),
                columns,
                ..
            }) => columns.len().max(1),
            _ => 0,
        }
    }

    fn get_result(&mut self) -> Option<Box<dyn InternalResult>> {
        let query = self.current.as_mut()?;
        let rows = query.rows.take()?;
        Some(Box::new(MockResult {
            fields: RowFields::new(query.columns.clone()),
            rows: rows.into(),
        }))
    }

    fn affected_rows(&self) -> u64 {
        self.current.as_ref().map_or(0, |q| q.affected_rows)
    }

    fn last_insert_id(&self) -> u64 {
        self.current.as_ref().map_or(0, |q| q.last_insert_id)
    }

    fn server_status(&self) -> ServerStatusFlags {
        self.current.as_ref().map_or_else(ServerStatusFlags::empty, |q| q.status)
    }

    fn set_use_checksum(&mut self, enabled: bool) {
        self.state.lock().use_checksum = Some(enabled);
    }

    fn reset_conn(&mut self) -> Status {
        self.state.lock().reset_calls += 1;
        Status::Done
    }

    fn change_user(&mut self, key: &ConnectionKey) -> Status {
        self.state.lock().changed_users.push(key.user.clone());
        Status::Done
    }
}

struct MockResult {
    fields: RowFields,
    rows: VecDeque<FetchRow>,
}

impl InternalResult for MockResult {
    fn fetch_row(&mut self) -> FetchRow {
        self.rows.pop_front().unwrap_or(FetchRow::Done)
    }

    fn row_fields(&self) -> RowFields {
        self.fields.clone()
    }
}

pub(crate) struct MockFactory {
    state: SharedState,
}

impl ConnectionFactory for MockFactory {
    fn create_connection(&self, _key: &ConnectionKey) -> Box<dyn InternalConnection> {
        Box::new(MockConnection {
            state: Arc::clone(&self.state),
            initialized: false,
            current: None,
            errno: 0,
            error: String::new(),
        })
    }

    fn kill_query(&self, key: &ConnectionKey, connection_id: u64) -> Result<()> {
        self.state.lock().kills.push((key.clone(), connection_id));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct MockSslProvider {
    pub stored: Mutex<Vec<Vec<u8>>>,
}

impl SslOptionsProvider for MockSslProvider {
    fn session(&self) -> Option<Vec<u8>> {
        self.stored.lock().last().cloned()
    }

    fn store_session(&self, session: Vec<u8>) -> bool {
        self.stored.lock().push(session);
        true
    }
}

pub(crate) fn client_with(state: MockState) -> (Client, SharedState) {
    client_with_handler(state, NonBlockingHandler)
}

pub(crate) fn client_with_handler(
    state: MockState,
    handler: impl ProtocolHandler + 'static,
) -> (Client, SharedState) {
    let shared = Arc::new(Mutex::new(state));
    let factory = MockFactory {
        state: Arc::clone(&shared),
    };
    let client = Client::new(factory, handler).unwrap();
    (client, shared)
}

pub(crate) fn key() -> ConnectionKey {
    ConnectionKey::new("db1", 3306, "app")
}

/// Poll `cond` until it holds or a second passes
pub(crate) async fn eventually(cond: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Connect through the mock backend and hand back the established connection
pub(crate) async fn connected(state: MockState) -> (Client, SharedState, crate::Connection) {
    connected_with(state, |_| {}).await
}

pub(crate) async fn connected_with(
    state: MockState,
    configure: impl FnOnce(&ConnectOperation),
) -> (Client, SharedState, crate::Connection) {
    let (client, shared) = client_with(state);
    let op = client.begin_connect(key());
    configure(&op);
    op.run().unwrap();
    op.wait().await;
    let conn = op.take_connection().unwrap();
    (client, shared, conn)
}
