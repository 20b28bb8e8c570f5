//! Query operations: single statement, multi-statement, and streaming
//! multi-statement, in both connection-borrowing and connection-consuming
//! flavors.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::client::ClientCore;
use crate::connection::{Connection, ConnectionInner, OperationReport};
use crate::error::Error;
use crate::options::ConnectionKey;
use crate::protocol::{cr, ProtocolHandle, ServerError, ServerStatus};
use crate::result::{
    DbMultiQueryResult, DbQueryResult, QueryOutcome, StatementResult, StreamEvent, StreamItem,
};
use crate::socket_handler::SocketHandler;
use crate::Result;

use super::{
    drive_fetch_row, drive_step, ConnectionProxy, OperationCore, RowOutcome, StepOutcome,
};

/// Where a query operation's terminal result goes.
pub(crate) enum Delivery {
    Query(oneshot::Sender<Result<DbQueryResult>>),
    Multi(oneshot::Sender<Result<DbMultiQueryResult>>),
    OwnedQuery(oneshot::Sender<Result<(Connection, DbQueryResult)>>),
    OwnedMulti(oneshot::Sender<Result<(Connection, DbMultiQueryResult)>>),
    Stream {
        events: mpsc::UnboundedSender<StreamEvent>,
        ended: oneshot::Sender<()>,
    },
}

pub(crate) struct QueryOperation {
    core: Arc<OperationCore>,
    proxy: ConnectionProxy,
    inner: Box<ConnectionInner>,
    queries: Vec<String>,
    delivery: Delivery,
}

impl QueryOperation {
    /// Registers and schedules a query operation. On refusal the
    /// connection's guts are restored through the proxy before the error is
    /// returned.
    pub(crate) fn begin(
        client: &Arc<ClientCore>,
        proxy: ConnectionProxy,
        inner: Box<ConnectionInner>,
        queries: Vec<String>,
        delivery: Delivery,
        timeout: Duration,
    ) -> Result<Arc<OperationCore>> {
        let core = OperationCore::new(client.clone(), timeout);
        if let Err(err) = client.add_pending(core.clone()) {
            proxy.restore(inner);
            return Err(err);
        }
        let op = QueryOperation {
            core: core.clone(),
            proxy,
            inner,
            queries,
            delivery,
        };
        if !client.run_in_thread(move || op.spawn()) {
            client.abort_pending(&core);
            return Err(Error::Client(
                "client reactor is no longer running".to_string(),
            ));
        }
        Ok(core)
    }

    pub(crate) fn spawn(self) {
        tokio::task::spawn_local(self.run());
    }

    async fn run(mut self) {
        if !self.core.begin_pending() {
            self.deliver(Err(Error::Cancelled));
            return;
        }
        debug!(
            operation = self.core.id(),
            queries = self.queries.len(),
            "query operation started"
        );

        if let Some(pre_operation) = self.inner.callbacks.pre_operation.as_mut() {
            pre_operation();
        }
        // The pre-query callback yields a deferred completion; the first
        // protocol call waits for it.
        if let Some(pre_query) = self.inner.callbacks.pre_query.as_mut() {
            let gate = pre_query();
            let cancelled = tokio::select! {
                biased;
                _ = self.core.cancelled() => true,
                () = gate => false,
            };
            if cancelled {
                self.deliver(Err(Error::Cancelled));
                return;
            }
        }

        let key = self.inner.holder.key().clone();
        let events = match &self.delivery {
            Delivery::Stream { events, .. } => Some(events.clone()),
            _ => None,
        };

        let exec = {
            let inner = &mut *self.inner;
            inner.socket.set_operation(self.core.id());
            inner.socket.arm_timeout(self.core.timeout());
            execute(
                &self.core,
                &mut inner.socket,
                inner.holder.handle_mut(),
                &self.queries,
                events.as_ref(),
            )
            .await
        };
        self.inner.socket.clear_operation();

        let result = match exec {
            Ok(success) => Ok(success),
            Err(ExecFailure::Server {
                err,
                queries_executed,
            }) => Err(Error::QueryFailed {
                errno: err.errno,
                message: err.message,
                queries_executed,
                key: key.clone(),
                status: self.inner.holder.handle().server_status(),
                elapsed: self.core.elapsed(),
            }),
            Err(ExecFailure::Socket {
                err,
                queries_executed,
            }) => Err(Error::QueryFailed {
                errno: cr::SERVER_LOST,
                message: format!("socket error during query: {err}"),
                queries_executed,
                key: key.clone(),
                status: ServerStatus::default(),
                elapsed: self.core.elapsed(),
            }),
            Err(ExecFailure::TimedOut) => Err(Error::Timeout {
                elapsed: self.core.elapsed(),
            }),
            Err(ExecFailure::Cancelled) => Err(Error::Cancelled),
        };
        self.deliver(result);
    }

    /// The single terminal path: fixes the holder's reuse state, fires the
    /// collaborators and the post-operation callback, transforms the result
    /// through the post-query callback, restores the connection through the
    /// proxy and publishes exactly one result.
    fn deliver(self, result: std::result::Result<ExecSuccess, Error>) {
        let QueryOperation {
            core,
            proxy,
            mut inner,
            queries,
            delivery,
        } = self;
        let client = core.client().clone();
        let key = inner.holder.key().clone();
        let elapsed = core.elapsed();

        if !core.try_complete() {
            // Completion raced a shutdown-side completion; the connection
            // guts still travel home.
            proxy.restore(inner);
            return;
        }

        let log_sql = queries.join("; ");
        match &result {
            Ok(_) => {
                client.stats().incr_succeeded_queries();
                client.logger().log_query_success(&key, &log_sql, elapsed);
            }
            Err(err) => {
                client.stats().incr_failed_queries(err.errno());
                client.logger().log_query_failure(&key, &log_sql, err);
                inner.holder.mark_not_reusable();
            }
        }

        if let Some(post_operation) = inner.callbacks.post_operation.as_mut() {
            post_operation(&OperationReport {
                success: result.is_ok(),
                elapsed,
            });
        }

        let post_query = inner.callbacks.post_query.take();
        let restored = proxy.restore(inner);

        match delivery {
            Delivery::Query(tx) => {
                let _ = tx.send(result.map(|s| s.into_query(key, elapsed)).and_then(|r| {
                    transform_query(post_query, r)
                }));
            }
            Delivery::Multi(tx) => {
                let _ = tx.send(result.map(|s| s.into_multi(key, elapsed)).and_then(|r| {
                    transform_multi(post_query, r)
                }));
            }
            Delivery::OwnedQuery(tx) => {
                let conn = restored.expect("owned operation restored no connection");
                let _ = tx.send(
                    result
                        .map(|s| s.into_query(key, elapsed))
                        .and_then(|r| transform_query(post_query, r))
                        .map(|r| (conn, r)),
                );
            }
            Delivery::OwnedMulti(tx) => {
                let conn = restored.expect("owned operation restored no connection");
                let _ = tx.send(
                    result
                        .map(|s| s.into_multi(key, elapsed))
                        .and_then(|r| transform_multi(post_query, r))
                        .map(|r| (conn, r)),
                );
            }
            Delivery::Stream { events, ended } => {
                match result {
                    Ok(_) => {
                        let _ = events.send(StreamEvent::End);
                    }
                    Err(err) => {
                        let _ = events.send(StreamEvent::Failed(err));
                    }
                }
                let _ = ended.send(());
            }
        }
        core.finish();
    }
}

type PostQuery = Option<Box<dyn FnMut(QueryOutcome) -> QueryOutcome + Send>>;

fn transform_query(post_query: PostQuery, result: DbQueryResult) -> Result<DbQueryResult> {
    match post_query {
        None => Ok(result),
        Some(mut cb) => match cb(QueryOutcome::Query(result)) {
            QueryOutcome::Query(result) => Ok(result),
            QueryOutcome::MultiQuery(_) => Err(Error::Client(
                "post-query callback changed the result variant".to_string(),
            )),
        },
    }
}

fn transform_multi(post_query: PostQuery, result: DbMultiQueryResult) -> Result<DbMultiQueryResult> {
    match post_query {
        None => Ok(result),
        Some(mut cb) => match cb(QueryOutcome::MultiQuery(result)) {
            QueryOutcome::MultiQuery(result) => Ok(result),
            QueryOutcome::Query(_) => Err(Error::Client(
                "post-query callback changed the result variant".to_string(),
            )),
        },
    }
}

/// Everything the engine learned from a fully successful run.
struct ExecSuccess {
    statements: Vec<StatementResult>,
    status: ServerStatus,
}

impl ExecSuccess {
    fn into_query(mut self, key: ConnectionKey, elapsed: Duration) -> DbQueryResult {
        let first = if self.statements.is_empty() {
            StatementResult {
                rows: Vec::new(),
                rows_affected: 0,
            }
        } else {
            self.statements.swap_remove(0)
        };
        DbQueryResult {
            rows: first.rows,
            rows_affected: first.rows_affected,
            status: self.status,
            key,
            elapsed,
        }
    }

    fn into_multi(self, key: ConnectionKey, elapsed: Duration) -> DbMultiQueryResult {
        DbMultiQueryResult {
            statements: self.statements,
            status: self.status,
            key,
            elapsed,
        }
    }
}

enum ExecFailure {
    Server {
        err: ServerError,
        queries_executed: usize,
    },
    Socket {
        err: io::Error,
        queries_executed: usize,
    },
    TimedOut,
    Cancelled,
}

/// Drives the whole statement pipeline: send the (possibly multi-statement)
/// query, then for each result set open it, fetch its rows, and advance to
/// the next one until the server reports no more.
///
/// In streaming mode rows and statement boundaries are pushed into `events`
/// as they arrive instead of being accumulated.
async fn execute(
    core: &OperationCore,
    socket: &mut SocketHandler,
    handle: &mut dyn ProtocolHandle,
    queries: &[String],
    events: Option<&mpsc::UnboundedSender<StreamEvent>>,
) -> std::result::Result<ExecSuccess, ExecFailure> {
    let sql = queries.join(";");
    let mut statements: Vec<StatementResult> = Vec::new();

    let sent = drive_step(core, socket, handle, |h| h.run_query(&sql)).await;
    if let Some(failure) = step_failure(sent, statements.len()) {
        return Err(failure);
    }

    loop {
        if let Err(err) = handle.use_result() {
            return Err(ExecFailure::Server {
                err,
                queries_executed: statements.len(),
            });
        }

        let mut rows = Vec::new();
        loop {
            match drive_fetch_row(core, socket, handle).await {
                RowOutcome::Row(row) => match events {
                    Some(events) => {
                        let _ = events.send(StreamEvent::Item(StreamItem::Row(row)));
                    }
                    None => rows.push(row),
                },
                RowOutcome::Done => break,
                RowOutcome::Cancelled => return Err(ExecFailure::Cancelled),
                RowOutcome::TimedOut => return Err(ExecFailure::TimedOut),
                RowOutcome::SocketError(err) => {
                    return Err(ExecFailure::Socket {
                        err,
                        queries_executed: statements.len(),
                    })
                }
            }
        }

        let rows_affected = handle.affected_rows();
        let status = handle.server_status();
        if let Some(events) = events {
            let _ = events.send(StreamEvent::Item(StreamItem::QueryEnd {
                rows_affected,
                status,
            }));
        }
        statements.push(StatementResult {
            rows,
            rows_affected,
        });

        if !status.more_results {
            return Ok(ExecSuccess { statements, status });
        }

        let advanced = drive_step(core, socket, handle, |h| h.next_result()).await;
        if let Some(failure) = step_failure(advanced, statements.len()) {
            return Err(failure);
        }
    }
}

fn step_failure(outcome: StepOutcome, queries_executed: usize) -> Option<ExecFailure> {
    match outcome {
        StepOutcome::Done => None,
        StepOutcome::Failed(err) => Some(ExecFailure::Server {
            err,
            queries_executed,
        }),
        StepOutcome::Cancelled => Some(ExecFailure::Cancelled),
        StepOutcome::TimedOut => Some(ExecFailure::TimedOut),
        StepOutcome::SocketError(err) => Some(ExecFailure::Socket {
            err,
            queries_executed,
        }),
    }
}
