//! The user-facing connection handle.
//!
//! A [`Connection`] pairs the holder of a native protocol session with its
//! settings, callbacks and socket handler, and is the object through which
//! queries are issued. At most one operation may be in progress on a
//! connection at a time.
//!
//! Blocking methods lend the connection's guts to an operation on the
//! reactor and take them back once it completes. Future-returning methods
//! consume the `Connection` and yield it back inside the success value.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::client::ClientCore;
use crate::error::Error;
use crate::future::{self, DbFuture};
use crate::holder::ConnectionHolder;
use crate::operation::query::{Delivery, QueryOperation};
use crate::operation::special::{AdminOperation, AdminVerb, RecycleResetOperation};
use crate::operation::{ConnectionProxy, OperationCore, ReturnSlot, EMPTY_MULTI_QUERY};
use crate::options::{ConnectionKey, ConnectionOptions};
use crate::result::{DbMultiQueryResult, DbQueryResult, QueryOutcome, StreamHandler};
use crate::socket_handler::SocketHandler;
use crate::Result;

/// What a post-operation callback learns about the terminal outcome.
#[derive(Debug, Clone, Copy)]
pub struct OperationReport {
    pub success: bool,
    pub elapsed: Duration,
}

/// The deferred completion a pre-query callback hands back; the operation
/// waits for it before issuing its first protocol call.
pub type PreQueryGate = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Per-connection user callbacks. Absent callbacks are no-ops.
#[derive(Default)]
pub(crate) struct ConnectionCallbacks {
    pub(crate) pre_operation: Option<Box<dyn FnMut() + Send>>,
    pub(crate) post_operation: Option<Box<dyn FnMut(&OperationReport) + Send>>,
    pub(crate) pre_query: Option<Box<dyn FnMut() -> PreQueryGate + Send>>,
    pub(crate) post_query: Option<Box<dyn FnMut(QueryOutcome) -> QueryOutcome + Send>>,
}

impl fmt::Debug for ConnectionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCallbacks")
            .field("pre_operation", &self.pre_operation.is_some())
            .field("post_operation", &self.post_operation.is_some())
            .field("pre_query", &self.pre_query.is_some())
            .field("post_query", &self.post_query.is_some())
            .finish()
    }
}

/// The parts of a connection an operation borrows or owns while it runs.
#[derive(Debug)]
pub(crate) struct ConnectionInner {
    pub(crate) holder: ConnectionHolder,
    pub(crate) opts: ConnectionOptions,
    pub(crate) socket: SocketHandler,
    pub(crate) callbacks: ConnectionCallbacks,
}

/// A live connection to a MySQL server.
pub struct Connection {
    client: Arc<ClientCore>,
    id: u64,
    key: ConnectionKey,
    inner: Option<Box<ConnectionInner>>,
    return_slot: ReturnSlot,
    operation_in_progress: bool,
    dying: Option<Box<dyn FnOnce(ConnectionHolder) + Send>>,
}

impl Connection {
    pub(crate) fn assemble(
        client: Arc<ClientCore>,
        id: u64,
        holder: ConnectionHolder,
        opts: ConnectionOptions,
    ) -> Self {
        let key = holder.key().clone();
        Self {
            client,
            id,
            key,
            inner: Some(Box::new(ConnectionInner {
                holder,
                opts,
                socket: SocketHandler::new(),
                callbacks: ConnectionCallbacks::default(),
            })),
            return_slot: Arc::new(Mutex::new(None)),
            operation_in_progress: false,
            dying: None,
        }
    }

    /// Reinstalls guts returned by an owned operation.
    pub(crate) fn put_back(&mut self, inner: Box<ConnectionInner>) {
        self.key = inner.holder.key().clone();
        self.inner = Some(inner);
        self.operation_in_progress = false;
    }

    /// Picks up guts a referenced operation left in the return slot.
    fn reclaim(&mut self) {
        if self.inner.is_none() {
            let taken = self.return_slot.lock().unwrap().take();
            if let Some(inner) = taken {
                self.put_back(inner);
            }
        }
    }

    /// The endpoint this connection was opened against (as of the last
    /// completed operation; a change-user rewrites it).
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Whether the native session is present and usable.
    pub fn ok(&self) -> bool {
        if let Some(inner) = &self.inner {
            return inner.holder.ok();
        }
        if let Some(inner) = &*self.return_slot.lock().unwrap() {
            return inner.holder.ok();
        }
        false
    }

    pub fn in_transaction(&self) -> bool {
        if let Some(inner) = &self.inner {
            return inner.holder.in_transaction();
        }
        if let Some(inner) = &*self.return_slot.lock().unwrap() {
            return inner.holder.in_transaction();
        }
        false
    }

    /// Whether the session is in a state a pool could reuse. Cleared by
    /// failed, cancelled or timed-out operations.
    pub fn reusable(&self) -> bool {
        if let Some(inner) = &self.inner {
            return inner.holder.is_reusable();
        }
        if let Some(inner) = &*self.return_slot.lock().unwrap() {
            return inner.holder.is_reusable();
        }
        false
    }

    /// Installs the callback that receives this connection's holder when the
    /// connection is destroyed, typically to return it to a pool.
    pub fn set_dying_callback(
        &mut self,
        callback: impl FnOnce(ConnectionHolder) + Send + 'static,
    ) {
        self.dying = Some(Box::new(callback));
    }

    pub fn set_pre_operation_callback(
        &mut self,
        callback: impl FnMut() + Send + 'static,
    ) -> Result<()> {
        self.with_callbacks(|cb| cb.pre_operation = Some(Box::new(callback)))
    }

    pub fn set_post_operation_callback(
        &mut self,
        callback: impl FnMut(&OperationReport) + Send + 'static,
    ) -> Result<()> {
        self.with_callbacks(|cb| cb.post_operation = Some(Box::new(callback)))
    }

    pub fn set_pre_query_callback(
        &mut self,
        callback: impl FnMut() -> PreQueryGate + Send + 'static,
    ) -> Result<()> {
        self.with_callbacks(|cb| cb.pre_query = Some(Box::new(callback)))
    }

    pub fn set_post_query_callback(
        &mut self,
        callback: impl FnMut(QueryOutcome) -> QueryOutcome + Send + 'static,
    ) -> Result<()> {
        self.with_callbacks(|cb| cb.post_query = Some(Box::new(callback)))
    }

    fn with_callbacks(&mut self, install: impl FnOnce(&mut ConnectionCallbacks)) -> Result<()> {
        self.reclaim();
        match self.inner.as_mut() {
            Some(inner) => {
                install(&mut inner.callbacks);
                Ok(())
            }
            None => Err(Error::OperationInProgress),
        }
    }

    /// Takes the guts for a new operation, enforcing the single-operation
    /// invariant and the holder's usability.
    fn take_guts(&mut self) -> Result<Box<ConnectionInner>> {
        self.reclaim();
        match self.inner.take() {
            Some(inner) => {
                if !inner.holder.ok() {
                    self.inner = Some(inner);
                    return Err(Error::InvalidConnection(
                        "protocol session is no longer usable".to_string(),
                    ));
                }
                self.operation_in_progress = true;
                Ok(inner)
            }
            None => {
                if self.operation_in_progress {
                    Err(Error::OperationInProgress)
                } else {
                    Err(Error::InvalidConnection(
                        "connection has no holder".to_string(),
                    ))
                }
            }
        }
    }

    // --- blocking surface -------------------------------------------------

    /// Runs `sql` and blocks until its result is available.
    pub fn query(&mut self, sql: impl Into<String>) -> Result<DbQueryResult> {
        let result = self.begin_query(sql).wait();
        self.reclaim();
        result
    }

    /// Runs several statements in one round trip and blocks for all their
    /// results.
    pub fn multi_query(&mut self, queries: Vec<String>) -> Result<DbMultiQueryResult> {
        let result = self.begin_multi_query(queries).wait();
        self.reclaim();
        result
    }

    /// Starts a streaming multi-query and returns the pull handle for its
    /// rows. The handle must outlive the operation; dropping it early blocks
    /// until the operation has wound down.
    pub fn stream_multi_query(&mut self, queries: Vec<String>) -> Result<StreamHandler> {
        if queries.is_empty() {
            return Err(Error::Client(EMPTY_MULTI_QUERY.to_string()));
        }
        let inner = self.guts_for_operation()?;
        let timeout = inner.opts.multi_query_timeout();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ended_tx, ended_rx) = oneshot::channel();
        let client = self.client.clone();
        let core = QueryOperation::begin(
            &client,
            ConnectionProxy::Referenced(self.return_slot.clone()),
            inner,
            queries,
            Delivery::Stream {
                events: events_tx,
                ended: ended_tx,
            },
            timeout,
        )
        .map_err(|err| {
            self.reclaim();
            err
        })?;
        Ok(StreamHandler {
            events: events_rx,
            ended: Some(ended_rx),
            core,
            finished: false,
        })
    }

    /// Sends `COM_RESET_CONNECTION` and blocks until the session is clean.
    pub fn reset(&mut self) -> Result<()> {
        let result = self.begin_reset().wait();
        self.reclaim();
        result
    }

    /// Re-authenticates the session as `user` against `database`, blocking
    /// until done. On success the connection's key reflects the new
    /// credentials.
    pub fn change_user(
        &mut self,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Result<()> {
        let result = self.begin_change_user(user, password, database).wait();
        self.reclaim();
        result
    }

    pub fn begin_transaction(&mut self) -> Result<()> {
        self.query("BEGIN").map(|_| ())
    }

    pub fn commit_transaction(&mut self) -> Result<()> {
        self.query("COMMIT").map(|_| ())
    }

    pub fn rollback_transaction(&mut self) -> Result<()> {
        self.query("ROLLBACK").map(|_| ())
    }

    // --- deferred surface -------------------------------------------------

    /// Starts a query without waiting; the connection stays with the caller
    /// and becomes usable again once the returned future resolves.
    pub fn begin_query(&mut self, sql: impl Into<String>) -> DbFuture<DbQueryResult> {
        let (tx, rx) = oneshot::channel();
        match self.begin_referenced(vec![sql.into()], TimeoutKind::Query, Delivery::Query(tx)) {
            Ok(core) => DbFuture::new(rx).with_core(core),
            Err(err) => DbFuture::ready(Err(err)),
        }
    }

    pub fn begin_multi_query(&mut self, queries: Vec<String>) -> DbFuture<DbMultiQueryResult> {
        if queries.is_empty() {
            return DbFuture::ready(Err(Error::Client(EMPTY_MULTI_QUERY.to_string())));
        }
        let (tx, rx) = oneshot::channel();
        match self.begin_referenced(queries, TimeoutKind::Multi, Delivery::Multi(tx)) {
            Ok(core) => DbFuture::new(rx).with_core(core),
            Err(err) => DbFuture::ready(Err(err)),
        }
    }

    pub fn begin_reset(&mut self) -> DbFuture<()> {
        self.begin_admin(AdminVerb::Reset)
    }

    pub fn begin_change_user(
        &mut self,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> DbFuture<()> {
        self.begin_admin(AdminVerb::ChangeUser {
            user: user.into(),
            password: password.into(),
            database: database.into(),
        })
    }

    /// Consumes the connection and resolves to it plus the query result once
    /// the operation completes. On failure the connection is dropped.
    pub fn query_future(mut self, sql: impl Into<String>) -> DbFuture<(Connection, DbQueryResult)> {
        let inner = match self.guts_for_operation() {
            Ok(inner) => inner,
            Err(err) => return DbFuture::ready(Err(err)),
        };
        let timeout = inner.opts.get_query_timeout();
        let (tx, rx) = oneshot::channel();
        let client = self.client.clone();
        match QueryOperation::begin(
            &client,
            ConnectionProxy::Owned(self),
            inner,
            vec![sql.into()],
            Delivery::OwnedQuery(tx),
            timeout,
        ) {
            Ok(core) => DbFuture::new(rx).with_core(core),
            Err(err) => DbFuture::ready(Err(err)),
        }
    }

    pub fn multi_query_future(
        mut self,
        queries: Vec<String>,
    ) -> DbFuture<(Connection, DbMultiQueryResult)> {
        if queries.is_empty() {
            return DbFuture::ready(Err(Error::Client(EMPTY_MULTI_QUERY.to_string())));
        }
        let inner = match self.guts_for_operation() {
            Ok(inner) => inner,
            Err(err) => return DbFuture::ready(Err(err)),
        };
        let timeout = inner.opts.multi_query_timeout();
        let (tx, rx) = oneshot::channel();
        let client = self.client.clone();
        match QueryOperation::begin(
            &client,
            ConnectionProxy::Owned(self),
            inner,
            queries,
            Delivery::OwnedMulti(tx),
            timeout,
        ) {
            Ok(core) => DbFuture::new(rx).with_core(core),
            Err(err) => DbFuture::ready(Err(err)),
        }
    }

    // --- plumbing ---------------------------------------------------------

    fn guts_for_operation(&mut self) -> Result<Box<ConnectionInner>> {
        self.client.ensure_accepting()?;
        self.take_guts()
    }

    fn begin_referenced(
        &mut self,
        queries: Vec<String>,
        timeout_kind: TimeoutKind,
        delivery: Delivery,
    ) -> Result<Arc<OperationCore>> {
        let inner = self.guts_for_operation()?;
        let timeout = match timeout_kind {
            TimeoutKind::Query => inner.opts.get_query_timeout(),
            TimeoutKind::Multi => inner.opts.multi_query_timeout(),
        };
        let client = self.client.clone();
        QueryOperation::begin(
            &client,
            ConnectionProxy::Referenced(self.return_slot.clone()),
            inner,
            queries,
            delivery,
            timeout,
        )
        .map_err(|err| {
            self.reclaim();
            err
        })
    }

    fn begin_admin(&mut self, verb: AdminVerb) -> DbFuture<()> {
        let inner = match self.guts_for_operation() {
            Ok(inner) => inner,
            Err(err) => return DbFuture::ready(Err(err)),
        };
        let (tx, rx) = oneshot::channel();
        let client = self.client.clone();
        match AdminOperation::begin(&client, self.return_slot.clone(), inner, verb, tx) {
            Ok(core) => DbFuture::new(rx).with_core(core),
            Err(err) => {
                self.reclaim();
                DbFuture::ready(Err(err))
            }
        }
    }

    /// The dying-connection protocol: decides whether the holder is closed,
    /// recycled as-is, or reset first.
    fn dispose(&mut self, inner: Box<ConnectionInner>) {
        let Some(recycle) = self.dying.take() else {
            // No recycler: dropping the guts closes the native handle.
            return;
        };

        let wants_reset = inner.opts.get_reset_conn_before_close()
            && inner.holder.is_reusable()
            && !inner.holder.in_transaction();

        if !wants_reset {
            let ConnectionInner { holder, .. } = *inner;
            recycle(holder);
            return;
        }

        if self.client.on_reactor_thread() {
            let ConnectionInner { mut holder, opts, .. } = *inner;
            if opts.get_delayed_reset_conn() {
                // The pool performs the reset before next use.
                holder.mark_needs_reset();
            }
            recycle(holder);
            return;
        }

        if !self.client.accepting_new_operations() {
            // Shutdown is past the point of accepting the reset hop.
            let ConnectionInner { holder, .. } = *inner;
            recycle(holder);
            return;
        }

        let (op, done) = RecycleResetOperation::new(&self.client, inner, recycle);
        let core = op.core();
        let client = self.client.clone();
        let scheduled = self.client.run_in_thread(move || {
            // Added to the pending set here, on the reactor, immediately
            // before the operation runs: adding it from the destructor's
            // thread would open a window for a shutdown sweep to remove it
            // while it still sat on the to-remove list, tripping the
            // double-remove check.
            client.add_pending_unchecked(core);
            op.spawn();
        });
        if !scheduled {
            return;
        }
        if future::blocking_guard().is_ok() {
            let _ = done.blocking_recv();
        } else {
            warn!(
                key = %self.key,
                "connection dropped inside a foreign async context; reset before recycle proceeds unawaited"
            );
        }
    }
}

enum TimeoutKind {
    Query,
    Multi,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("operation_in_progress", &self.operation_in_progress)
            .finish_non_exhaustive()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reclaim();
        match self.inner.take() {
            Some(inner) => self.dispose(inner),
            None => {
                if self.operation_in_progress {
                    warn!(
                        key = %self.key,
                        "connection dropped while an operation still holds it"
                    );
                }
            }
        }
        self.client.unregister_connection(self.id);
    }
}
