use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::handler::{FetchRow, InternalResult, ProtocolHandler};
use crate::row::{Row, RowFields};

/// Rows of the result set currently being fetched
///
/// At most one row is buffered ahead. Consumers drain it from a notification callback, or from
/// any thread while the operation is paused:
///
/// ```rs
/// op.with_row_stream(|stream| {
///     while stream.has_next() {
///         rows.push(stream.consume_row()?);
///     }
///     Ok(())
/// })??;
/// ```
pub struct RowStream {
    result: Option<Box<dyn InternalResult>>,
    handler: Arc<dyn ProtocolHandler>,
    fields: Arc<RowFields>,
    current_row: Option<Row>,
    query_finished: bool,
    failed: bool,
    num_rows_seen: u64,
    query_result_size: u64,
}

/// Outcome of pulling the next row from the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slurp {
    Row,
    Pending,
    Finished,
    Error,
}

impl RowStream {
    /// `None` for statements without a result set; such a stream is finished from the start
    pub(crate) fn new(result: Option<Box<dyn InternalResult>>, handler: Arc<dyn ProtocolHandler>) -> Self {
        let fields = result
            .as_ref()
            .map(|r| r.row_fields())
            .unwrap_or_default();
        Self {
            query_finished: result.is_none(),
            result,
            handler,
            fields: Arc::new(fields),
            current_row: None,
            failed: false,
            num_rows_seen: 0,
            query_result_size: 0,
        }
    }

    pub fn row_fields(&self) -> &Arc<RowFields> {
        &self.fields
    }

    /// True if a row can be consumed right now. May pull one row from the backend.
    pub fn has_next(&mut self) -> bool {
        self.slurp() == Slurp::Row
    }

    pub fn consume_row(&mut self) -> Result<Row> {
        if !self.has_next() {
            return Err(Error::StreamAccessError(
                "no row is available to consume".to_string(),
            ));
        }
        self.current_row
            .take()
            .ok_or_else(|| Error::bug("buffered row disappeared"))
    }

    pub(crate) fn slurp(&mut self) -> Slurp {
        if self.current_row.is_some() {
            return Slurp::Row;
        }
        if self.failed {
            return Slurp::Error;
        }
        if self.query_finished {
            return Slurp::Finished;
        }
        let Some(result) = self.result.as_mut() else {
            self.query_finished = true;
            return Slurp::Finished;
        };
        match self.handler.fetch_row(result.as_mut()) {
            FetchRow::Row(row) => {
                self.num_rows_seen += 1;
                self.query_result_size += row.payload_size();
                self.current_row = Some(row);
                Slurp::Row
            }
            FetchRow::Pending => Slurp::Pending,
            FetchRow::Done => {
                self.query_finished = true;
                Slurp::Finished
            }
            FetchRow::Error => {
                self.failed = true;
                Slurp::Error
            }
        }
    }

    pub(crate) fn has_buffered_row(&self) -> bool {
        self.current_row.is_some()
    }

    pub fn num_rows_seen(&self) -> u64 {
        self.num_rows_seen
    }

    /// Payload bytes of the rows fetched so far
    pub fn query_result_size(&self) -> u64 {
        self.query_result_size
    }
}

impl fmt::Debug for RowStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowStream")
            .field("fields", &self.fields)
            .field("buffered", &self.current_row.is_some())
            .field("query_finished", &self.query_finished)
            .field("failed", &self.failed)
            .field("num_rows_seen", &self.num_rows_seen)
            .finish_non_exhaustive()
    }
}
