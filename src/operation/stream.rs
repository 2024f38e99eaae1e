use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use super::{FetchConsumer, FetchOperation, OperationKind, OperationResult};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::opts::AttributeMap;
use crate::query::MultiQuery;
use crate::row::{Row, RowFields};

/// Summary of a completed statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEnd {
    pub query_index: usize,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub recv_gtid: Option<String>,
    pub resp_attrs: AttributeMap,
    pub more_results: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    /// A statement's result set starts
    QueryStart(Arc<RowFields>),
    Row(Row),
    QueryEnd(QueryEnd),
}

enum Event {
    InitQuery(Arc<RowFields>),
    RowsReady,
    QueryEnd(QueryEnd),
    Failed {
        result: OperationResult,
        errno: u32,
        message: String,
    },
    Completed,
}

/// Forwards notifications to the pulling side, pausing the fetch whenever rows are ready
struct StreamConsumer {
    tx: mpsc::UnboundedSender<Event>,
}

impl FetchConsumer for StreamConsumer {
    fn notify_init_query(&self, op: &FetchOperation) {
        let fields = op
            .with_row_stream(|stream| Arc::clone(stream.row_fields()))
            .unwrap_or_default();
        let _ = self.tx.send(Event::InitQuery(fields));
    }

    fn notify_rows_ready(&self, op: &FetchOperation) {
        if op.pause_for_consumer().is_ok() {
            let _ = self.tx.send(Event::RowsReady);
        }
    }

    fn notify_query_success(&self, op: &FetchOperation, more_results: bool) {
        let _ = self.tx.send(Event::QueryEnd(QueryEnd {
            query_index: op.num_current_query(),
            affected_rows: op.current_affected_rows(),
            last_insert_id: op.current_last_insert_id(),
            recv_gtid: op.current_recv_gtid(),
            resp_attrs: op.current_resp_attrs(),
            more_results,
        }));
    }

    fn notify_failure(&self, op: &FetchOperation, result: OperationResult) {
        let _ = self.tx.send(Event::Failed {
            result,
            errno: op.errno(),
            message: op.error_message(),
        });
    }

    fn notify_operation_completed(&self, _op: &FetchOperation, _result: OperationResult) {
        let _ = self.tx.send(Event::Completed);
    }
}

/// Pull-based reading of a multi-query
///
/// Rows are handed over one at a time: the fetch pauses whenever rows are buffered and resumes
/// once the puller drained them.
///
/// ```rs
/// let mut stream = conn.stream(queries)?;
/// while let Some(item) = stream.next().await? {
///     if let StreamItem::Row(row) = item {
///         println!("{:?}", row.get_str(0));
///     }
/// }
/// let conn = stream.take_connection()?;
/// ```
pub struct QueryStream {
    op: FetchOperation,
    rx: mpsc::UnboundedReceiver<Event>,
    paused: bool,
    done: bool,
}

impl QueryStream {
    pub(crate) fn start(conn: Connection, queries: MultiQuery) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let op = FetchOperation::new(
            conn,
            queries,
            Arc::new(StreamConsumer { tx }),
            OperationKind::MultiQueryStream,
        );
        op.run()?;
        Ok(Self {
            op,
            rx,
            paused: false,
            done: false,
        })
    }

    pub fn operation(&self) -> &FetchOperation {
        &self.op
    }

    /// Next item, `None` once every statement completed
    pub async fn next(&mut self) -> Result<Option<StreamItem>> {
        loop {
            if self.done {
                return Ok(None);
            }
            if self.paused {
                let row = self.op.with_row_stream(|stream| {
                    if stream.has_next() {
                        stream.consume_row().map(Some)
                    } else {
                        Ok(None)
                    }
                })??;
                match row {
                    Some(row) => return Ok(Some(StreamItem::Row(row))),
                    None => {
                        self.paused = false;
                        self.op.resume()?;
                    }
                }
            }

            let event = self.rx.recv().await;
            match event {
                Some(Event::InitQuery(fields)) => return Ok(Some(StreamItem::QueryStart(fields))),
                Some(Event::RowsReady) => self.paused = true,
                Some(Event::QueryEnd(end)) => return Ok(Some(StreamItem::QueryEnd(end))),
                Some(Event::Failed {
                    result,
                    errno,
                    message,
                }) => {
                    self.done = true;
                    return Err(Error::OperationFailed {
                        result,
                        errno,
                        message,
                    });
                }
                Some(Event::Completed) | None => {
                    debug!("query stream finished");
                    self.done = true;
                }
            }
        }
    }

    pub fn cancel(&self) {
        self.op.cancel();
    }

    /// Hand the connection back once the stream is finished
    pub fn take_connection(&self) -> Result<Connection> {
        self.op.take_connection()
    }
}

impl Drop for QueryStream {
    fn drop(&mut self) {
        if !self.op.done() {
            self.op.cancel();
        }
    }
}
