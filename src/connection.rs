use std::sync::Arc;

use tracing::{instrument, warn};

use crate::client::Client;
use crate::error::{Error, Result};
use crate::handler::{InternalConnection, Status};
use crate::operation::{FetchConsumer, FetchOperation, OperationKind, QueryStream};
use crate::opts::{ConnectionKey, ConnectionOptions};
use crate::query::{MultiQuery, Query};

/// Facts about an established connection, captured when the connect operation completes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionContext {
    pub is_ssl_connection: bool,
    pub ssl_session_reused: bool,
    pub ssl_version: Option<String>,
    /// Server version string
    pub endpoint_version: Option<String>,
}

/// An established connection
///
/// Obtained from a succeeded [`crate::ConnectOperation`]. Running a query moves the connection
/// into the [`FetchOperation`], which hands it back once the operation is terminal.
pub struct Connection {
    client: Client,
    key: Arc<ConnectionKey>,
    internal: Box<dyn InternalConnection>,
    options: ConnectionOptions,
    context: ConnectionContext,
}

impl Connection {
    pub(crate) fn new(
        client: Client,
        key: Arc<ConnectionKey>,
        internal: Box<dyn InternalConnection>,
    ) -> Self {
        Self {
            client,
            key,
            internal,
            options: ConnectionOptions::default(),
            context: ConnectionContext::default(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub(crate) fn shared_key(&self) -> Arc<ConnectionKey> {
        Arc::clone(&self.key)
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub(crate) fn set_options(&mut self, options: ConnectionOptions) {
        self.options = options;
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    pub(crate) fn set_context(&mut self, context: ConnectionContext) {
        self.context = context;
    }

    pub fn server_info(&self) -> Option<String> {
        self.internal.server_info()
    }

    pub fn connection_id(&self) -> u64 {
        self.internal.connection_id()
    }

    pub fn kill_on_query_timeout(&self) -> bool {
        self.options.kill_on_query_timeout
    }

    pub(crate) fn internal(&self) -> &dyn InternalConnection {
        self.internal.as_ref()
    }

    pub(crate) fn internal_mut(&mut self) -> &mut dyn InternalConnection {
        self.internal.as_mut()
    }

    /// Run `f` on the event loop thread that drives this connection
    pub fn run_in_thread<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.client.event_loop().run_in_thread(f)
    }

    /// Create an unstarted operation running a single query
    pub fn begin_query(
        self,
        query: impl Into<Query>,
        consumer: Arc<dyn FetchConsumer>,
    ) -> FetchOperation {
        let queries = MultiQuery::from(query.into());
        FetchOperation::new(self, queries, consumer, OperationKind::Query)
    }

    /// Create an unstarted operation running several statements in one round trip
    pub fn begin_multi_query(
        self,
        queries: MultiQuery,
        consumer: Arc<dyn FetchConsumer>,
    ) -> FetchOperation {
        FetchOperation::new(self, queries, consumer, OperationKind::MultiQuery)
    }

    /// Start `queries` and pull rows asynchronously
    pub fn stream(self, queries: MultiQuery) -> Result<QueryStream> {
        QueryStream::start(self, queries)
    }

    /// Reset the session state. Requires the backend to finish without blocking.
    #[instrument(skip_all)]
    pub fn reset(&mut self) -> Result<()> {
        let handler = self.client.shared_handler();
        match handler.reset_conn(self.internal.as_mut()) {
            Status::Done => Ok(()),
            Status::Pending => Err(Error::state("connection reset would block")),
            Status::Error => Err(Error::ServerError {
                errno: self.internal.errno(),
                message: self.internal.error_message(),
            }),
        }
    }

    /// Re-authenticate the connection as the user in `key`
    ///
    /// Only allowed when the connection was opened with `change_user` enabled; otherwise the
    /// caller is expected to open a new connection for the other user.
    #[instrument(skip_all)]
    pub fn change_user(&mut self, key: ConnectionKey) -> Result<()> {
        if !self.options.change_user {
            return Err(Error::BadConfigError(format!(
                "change_user is disabled for {}; open a new connection for {}",
                self.key, key.user
            )));
        }
        let handler = self.client.shared_handler();
        match handler.change_user(self.internal.as_mut(), &key) {
            Status::Done => {
                self.key = Arc::new(key);
                Ok(())
            }
            Status::Pending => Err(Error::state("change user would block")),
            Status::Error => Err(Error::ServerError {
                errno: self.internal.errno(),
                message: self.internal.error_message(),
            }),
        }
    }

    /// Close the connection, resetting it first when configured to
    #[instrument(skip_all)]
    pub fn close(mut self) {
        if self.options.reset_conn_before_close && !self.options.delayed_reset_conn {
            if let Err(e) = self.reset() {
                warn!(key = %self.key, error = %e, "failed to reset connection before close");
            }
        }
        self.internal.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}
