use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use super::{FetchConsumer, FetchOperation, OperationResult};
use crate::opts::AttributeMap;
use crate::row::{Row, RowFields};

/// Everything one statement produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    /// Position of the statement within its multi-query
    pub query_index: usize,
    pub fields: Arc<RowFields>,
    pub rows: Vec<Row>,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub recv_gtid: Option<String>,
    pub resp_attrs: AttributeMap,
}

#[derive(Default)]
struct CollectState {
    results: Vec<QueryResult>,
    current: Option<QueryResult>,
    failure: Option<OperationResult>,
}

/// Consumer that buffers every row of every statement in memory
///
/// ```rs
/// let collect = CollectConsumer::new();
/// let op = conn.begin_query("SELECT 1", collect.clone());
/// op.run()?;
/// op.wait().await;
/// let results = collect.take_results();
/// ```
#[derive(Default)]
pub struct CollectConsumer {
    state: Mutex<CollectState>,
}

impl CollectConsumer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Results of the statements that completed so far
    pub fn results(&self) -> Vec<QueryResult> {
        self.state.lock().results.clone()
    }

    pub fn take_results(&self) -> Vec<QueryResult> {
        std::mem::take(&mut self.state.lock().results)
    }

    /// Terminal failure result, if the operation did not succeed
    pub fn failure(&self) -> Option<OperationResult> {
        self.state.lock().failure
    }
}

impl FetchConsumer for CollectConsumer {
    fn notify_init_query(&self, op: &FetchOperation) {
        let fields = op
            .with_row_stream(|stream| Arc::clone(stream.row_fields()))
            .unwrap_or_default();
        self.state.lock().current = Some(QueryResult {
            query_index: op.num_current_query(),
            fields,
            ..Default::default()
        });
    }

    fn notify_rows_ready(&self, op: &FetchOperation) {
        let drained = op.with_row_stream(|stream| {
            let mut rows = Vec::new();
            while stream.has_next() {
                match stream.consume_row() {
                    Ok(row) => rows.push(row),
                    Err(_) => break,
                }
            }
            rows
        });
        match drained {
            Ok(rows) => {
                if let Some(current) = self.state.lock().current.as_mut() {
                    current.rows.extend(rows);
                }
            }
            Err(e) => warn!(error = %e, "failed to read rows"),
        }
    }

    fn notify_query_success(&self, op: &FetchOperation, _more_results: bool) {
        let mut state = self.state.lock();
        let mut result = state.current.take().unwrap_or_default();
        result.affected_rows = op.current_affected_rows();
        result.last_insert_id = op.current_last_insert_id();
        result.recv_gtid = op.current_recv_gtid();
        result.resp_attrs = op.current_resp_attrs();
        state.results.push(result);
    }

    fn notify_failure(&self, _op: &FetchOperation, result: OperationResult) {
        let mut state = self.state.lock();
        state.current = None;
        state.failure = Some(result);
    }
}
