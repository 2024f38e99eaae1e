use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use auto_impl::auto_impl;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use crate::constant::{ClientFlags, Compression, ServerStatusFlags};
use crate::error::Result;
use crate::operation::CertValidator;
use crate::opts::{AttributeMap, ConnectionKey, ConnectionOptions, SslOptionsProvider};
use crate::row::{Row, RowFields};

/// Outcome of one non-blocking protocol step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Done,
    /// The step would block; wait for socket readiness and retry
    Pending,
    Error,
}

/// Outcome of fetching a single row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchRow {
    Row(Row),
    /// No row is available yet
    Pending,
    /// The result set has no more rows
    Done,
    Error,
}

pub type ReadyFuture = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

/// A backend connection handle. Protocol steps never block; they return [`Status::Pending`]
/// when the socket is not ready.
///
/// Only the protocol steps and error accessors are mandatory. The setup hooks default to
/// no-ops so simple backends can ignore the options they do not support.
pub trait InternalConnection: Send {
    /// Full initialisation before the first connect attempt
    fn initialize(&mut self) {}

    /// Re-initialisation before a retry, keeping client-side state
    fn reinitialize(&mut self) {}

    fn has_initialized(&self) -> bool {
        true
    }

    /// Drop the underlying socket and protocol state
    fn close(&mut self) {}

    fn socket_descriptor(&self) -> Option<RawFd>;

    /// Direction the last `Pending` step is blocked on
    fn wait_interest(&self) -> Interest {
        Interest::READABLE
    }

    /// Resolves when the socket is ready in the direction of [`InternalConnection::wait_interest`]
    fn wait_ready(&self) -> ReadyFuture {
        match self.socket_descriptor() {
            Some(fd) => Box::pin(wait_for_socket(fd, self.wait_interest())),
            None => Box::pin(std::future::ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no socket descriptor to wait on",
            )))),
        }
    }

    fn is_done_with_tcp_handshake(&self) -> bool {
        true
    }

    fn connect_stage_name(&self) -> String {
        String::from("unknown")
    }

    fn errno(&self) -> u32;

    fn error_message(&self) -> String;

    fn server_info(&self) -> Option<String> {
        None
    }

    fn tls_version(&self) -> Option<String> {
        None
    }

    /// Server-side thread id, used to kill running queries
    fn connection_id(&self) -> u64 {
        0
    }

    fn set_connect_attributes(&mut self, _attributes: &AttributeMap) {}

    fn set_compression(&mut self, _compression: Compression) {}

    /// Returns true when TLS will be used
    fn set_ssl_options_provider(&mut self, _provider: &Arc<dyn SslOptionsProvider>) -> bool {
        false
    }

    fn set_sni_server_name(&mut self, _name: &str) {}

    /// Returns false when the marking could not be applied
    fn set_dscp(&mut self, _dscp: u8) -> bool {
        true
    }

    fn set_cert_validator(&mut self, _validator: CertValidator) {}

    fn set_connect_timeout(&mut self, _timeout: Duration) {}

    /// Hand the negotiated TLS session to the provider. Returns true if it was stored.
    fn store_session(&mut self, _provider: &Arc<dyn SslOptionsProvider>) -> bool {
        false
    }

    fn try_connect(
        &mut self,
        key: &ConnectionKey,
        opts: &ConnectionOptions,
        flags: ClientFlags,
    ) -> Status;

    fn run_query(&mut self, query: &str) -> Status;

    fn next_result(&mut self) -> Status;

    fn more_results(&self) -> bool;

    fn field_count(&self) -> usize;

    fn get_result(&mut self) -> Option<Box<dyn InternalResult>>;

    fn affected_rows(&self) -> u64;

    fn last_insert_id(&self) -> u64;

    fn recv_gtid(&self) -> Option<String> {
        None
    }

    fn response_attributes(&self) -> AttributeMap {
        AttributeMap::new()
    }

    fn server_status(&self) -> ServerStatusFlags {
        ServerStatusFlags::empty()
    }

    /// Ask the server to checksum the result sets of the next statements
    fn set_use_checksum(&mut self, _enabled: bool) {}

    fn reset_conn(&mut self) -> Status {
        Status::Done
    }

    fn change_user(&mut self, _key: &ConnectionKey) -> Status {
        Status::Done
    }
}

/// Handle to an in-flight result set
pub trait InternalResult: Send {
    fn fetch_row(&mut self) -> FetchRow;

    fn row_fields(&self) -> RowFields;
}

/// Performs protocol steps on an [`InternalConnection`]
#[auto_impl(&, Box, Arc)]
pub trait ProtocolHandler: Send + Sync {
    fn try_connect(
        &self,
        conn: &mut dyn InternalConnection,
        opts: &ConnectionOptions,
        key: &ConnectionKey,
        flags: ClientFlags,
    ) -> Status;

    fn run_query(&self, conn: &mut dyn InternalConnection, query: &str) -> Status;

    fn next_result(&self, conn: &mut dyn InternalConnection) -> Status;

    fn field_count(&self, conn: &dyn InternalConnection) -> usize;

    fn get_result(&self, conn: &mut dyn InternalConnection) -> Option<Box<dyn InternalResult>>;

    fn fetch_row(&self, result: &mut dyn InternalResult) -> FetchRow;

    fn reset_conn(&self, conn: &mut dyn InternalConnection) -> Status;

    fn change_user(&self, conn: &mut dyn InternalConnection, key: &ConnectionKey) -> Status;
}

/// Forwards each step to the connection exactly once
#[derive(Debug, Default, Clone, Copy)]
pub struct NonBlockingHandler;

impl ProtocolHandler for NonBlockingHandler {
    fn try_connect(
        &self,
        conn: &mut dyn InternalConnection,
        opts: &ConnectionOptions,
        key: &ConnectionKey,
        flags: ClientFlags,
    ) -> Status {
        conn.try_connect(key, opts, flags)
    }

    fn run_query(&self, conn: &mut dyn InternalConnection, query: &str) -> Status {
        conn.run_query(query)
    }

    fn next_result(&self, conn: &mut dyn InternalConnection) -> Status {
        conn.next_result()
    }

    fn field_count(&self, conn: &dyn InternalConnection) -> usize {
        conn.field_count()
    }

    fn get_result(&self, conn: &mut dyn InternalConnection) -> Option<Box<dyn InternalResult>> {
        conn.get_result()
    }

    fn fetch_row(&self, result: &mut dyn InternalResult) -> FetchRow {
        result.fetch_row()
    }

    fn reset_conn(&self, conn: &mut dyn InternalConnection) -> Status {
        conn.reset_conn()
    }

    fn change_user(&self, conn: &mut dyn InternalConnection, key: &ConnectionKey) -> Status {
        conn.change_user(key)
    }
}

/// Retries every step until it stops reporting [`Status::Pending`]
///
/// Meant for backends that are driven synchronously. Each retry sleeps for `poll_interval`, so
/// the calling thread is blocked for the whole step.
#[derive(Debug, Clone, Copy)]
pub struct BlockingHandler {
    poll_interval: Duration,
}

impl Default for BlockingHandler {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
        }
    }
}

impl BlockingHandler {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    fn block_on(&self, mut step: impl FnMut() -> Status) -> Status {
        loop {
            match step() {
                Status::Pending => std::thread::sleep(self.poll_interval),
                status => return status,
            }
        }
    }
}

impl ProtocolHandler for BlockingHandler {
    fn try_connect(
        &self,
        conn: &mut dyn InternalConnection,
        opts: &ConnectionOptions,
        key: &ConnectionKey,
        flags: ClientFlags,
    ) -> Status {
        self.block_on(|| conn.try_connect(key, opts, flags))
    }

    fn run_query(&self, conn: &mut dyn InternalConnection, query: &str) -> Status {
        self.block_on(|| conn.run_query(query))
    }

    fn next_result(&self, conn: &mut dyn InternalConnection) -> Status {
        self.block_on(|| conn.next_result())
    }

    fn field_count(&self, conn: &dyn InternalConnection) -> usize {
        conn.field_count()
    }

    fn get_result(&self, conn: &mut dyn InternalConnection) -> Option<Box<dyn InternalResult>> {
        conn.get_result()
    }

    fn fetch_row(&self, result: &mut dyn InternalResult) -> FetchRow {
        loop {
            match result.fetch_row() {
                FetchRow::Pending => std::thread::sleep(self.poll_interval),
                row => return row,
            }
        }
    }

    fn reset_conn(&self, conn: &mut dyn InternalConnection) -> Status {
        self.block_on(|| conn.reset_conn())
    }

    fn change_user(&self, conn: &mut dyn InternalConnection, key: &ConnectionKey) -> Status {
        self.block_on(|| conn.change_user(key))
    }
}

/// Creates backend connections and issues out-of-band requests
#[auto_impl(&, Box, Arc)]
pub trait ConnectionFactory: Send + Sync {
    fn create_connection(&self, key: &ConnectionKey) -> Box<dyn InternalConnection>;

    /// Kill the query running on `connection_id`. May block; called off the event loop.
    fn kill_query(&self, key: &ConnectionKey, connection_id: u64) -> Result<()>;
}

struct SocketFd(RawFd);

impl AsRawFd for SocketFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

async fn wait_for_socket(fd: RawFd, interest: Interest) -> io::Result<()> {
    // SAFETY: the descriptor is owned by the connection that is waiting. The operation aborts
    // its readiness wait before the connection is handed out or closed, so `fd` stays open and
    // unchanged for the lifetime of `async_fd`.
    let async_fd = unsafe { AsyncFd::register_with_interest(SocketFd(fd), interest) }?;
    let mut guard = async_fd.ready(interest).await?;
    guard.clear_ready();
    Ok(())
}
