//! Result values delivered by completed operations.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::error::Error;
use crate::future;
use crate::operation::OperationCore;
use crate::options::ConnectionKey;
use crate::protocol::ServerStatus;
use crate::Result;

/// One row of a result set.
///
/// Column values arrive as raw bytes; decoding into typed values is the
/// caller's concern. `NULL` columns are `None`. Column names are shared
/// across all rows of a result set.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Option<Bytes>>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Option<Bytes>>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The value at `index`, `None` when the column is `NULL` or out of
    /// range.
    pub fn value(&self, index: usize) -> Option<&Bytes> {
        self.values.get(index).and_then(|v| v.as_ref())
    }

    /// The value under the named column.
    pub fn value_named(&self, column: &str) -> Option<&Bytes> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.value(index)
    }

    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.values.get(index), Some(None))
    }
}

/// The result of a single query.
#[derive(Debug)]
pub struct DbQueryResult {
    pub(crate) rows: Vec<Row>,
    pub(crate) rows_affected: u64,
    pub(crate) status: ServerStatus,
    pub(crate) key: ConnectionKey,
    pub(crate) elapsed: Duration,
}

impl DbQueryResult {
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    pub fn server_status(&self) -> ServerStatus {
        self.status
    }

    /// The endpoint the originating connection was opened against.
    pub fn connection_key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

/// The rows and affected count of one statement within a multi-query.
#[derive(Debug)]
pub struct StatementResult {
    pub rows: Vec<Row>,
    pub rows_affected: u64,
}

/// The result of a multi-statement query.
#[derive(Debug)]
pub struct DbMultiQueryResult {
    pub(crate) statements: Vec<StatementResult>,
    pub(crate) status: ServerStatus,
    pub(crate) key: ConnectionKey,
    pub(crate) elapsed: Duration,
}

impl DbMultiQueryResult {
    pub fn statements(&self) -> &[StatementResult] {
        &self.statements
    }

    pub fn into_statements(self) -> Vec<StatementResult> {
        self.statements
    }

    pub fn num_queries_executed(&self) -> usize {
        self.statements.len()
    }

    pub fn server_status(&self) -> ServerStatus {
        self.status
    }

    pub fn connection_key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

/// The tagged union handed to a post-query callback.
///
/// The variant always matches the operation that produced it, so a callback
/// dispatches on the enum instead of downcasting.
#[derive(Debug)]
pub enum QueryOutcome {
    Query(DbQueryResult),
    MultiQuery(DbMultiQueryResult),
}

/// One item pulled from a streaming multi-query.
#[derive(Debug)]
pub enum StreamItem {
    Row(Row),
    /// A statement finished; its affected-row count and the server status
    /// observed at that boundary.
    QueryEnd {
        rows_affected: u64,
        status: ServerStatus,
    },
}

/// Events pushed by a streaming operation into its handler.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Item(StreamItem),
    Failed(Error),
    End,
}

/// Pull interface over an in-progress streaming multi-query.
///
/// Rows are produced on the reactor as the server sends them and consumed
/// here with [`next`](StreamHandler::next), which blocks the calling thread.
/// Dropping the handler before the stream is exhausted requests cancellation
/// of the underlying operation and then blocks until that operation has
/// fully ended, so the connection's guts are never abandoned mid-flight.
#[derive(Debug)]
pub struct StreamHandler {
    pub(crate) events: mpsc::UnboundedReceiver<StreamEvent>,
    pub(crate) ended: Option<oneshot::Receiver<()>>,
    pub(crate) core: Arc<OperationCore>,
    pub(crate) finished: bool,
}

impl StreamHandler {
    /// The next row or statement boundary, `None` once the stream has ended.
    pub fn next(&mut self) -> Result<Option<StreamItem>> {
        if self.finished {
            return Ok(None);
        }
        future::blocking_guard()?;

        match self.events.blocking_recv() {
            Some(StreamEvent::Item(item)) => Ok(Some(item)),
            Some(StreamEvent::Failed(err)) => {
                self.finish();
                Err(err)
            }
            Some(StreamEvent::End) | None => {
                self.finish();
                Ok(None)
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        if let Some(ended) = self.ended.take() {
            let _ = ended.blocking_recv();
        }
    }
}

impl Drop for StreamHandler {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.core.cancel();
        if future::blocking_guard().is_ok() {
            self.finish();
        } else {
            // Dropped inside an async context; blocking here would panic the
            // runtime, so the operation is left to unwind on the reactor.
            warn!("stream handler dropped inside an async context before the stream ended");
        }
    }
}
