//! Session-maintenance operations: reset, change-user, and the reset that
//! precedes recycling a dying connection.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::debug;

use crate::client::ClientCore;
use crate::connection::{ConnectionInner, OperationReport};
use crate::error::Error;
use crate::holder::ConnectionHolder;
use crate::protocol::{cr, ProtocolHandle, ServerStatus, Step};
use crate::Result;

use super::{drive_step, ConnectionProxy, OperationCore, ReturnSlot, StepOutcome};

/// Which session-maintenance command to drive.
pub(crate) enum AdminVerb {
    Reset,
    ChangeUser {
        user: String,
        password: String,
        database: String,
    },
}

impl AdminVerb {
    fn step(&self, handle: &mut dyn ProtocolHandle) -> Step {
        match self {
            AdminVerb::Reset => handle.reset(),
            AdminVerb::ChangeUser {
                user,
                password,
                database,
            } => handle.change_user(user, password, database),
        }
    }

    fn log_sql(&self) -> &'static str {
        match self {
            AdminVerb::Reset => "COM_RESET_CONNECTION",
            AdminVerb::ChangeUser { .. } => "COM_CHANGE_USER",
        }
    }
}

/// A reset or change-user issued on a caller-held connection.
pub(crate) struct AdminOperation {
    core: Arc<OperationCore>,
    slot: ReturnSlot,
    inner: Box<ConnectionInner>,
    verb: AdminVerb,
    tx: oneshot::Sender<Result<()>>,
}

impl AdminOperation {
    pub(crate) fn begin(
        client: &Arc<ClientCore>,
        slot: ReturnSlot,
        inner: Box<ConnectionInner>,
        verb: AdminVerb,
        tx: oneshot::Sender<Result<()>>,
    ) -> Result<Arc<OperationCore>> {
        // Change-user gets one second past the connect timeout so its own
        // deadline never races the handshake timeout inside the protocol
        // library.
        let timeout = match &verb {
            AdminVerb::Reset => inner.opts.get_query_timeout(),
            AdminVerb::ChangeUser { .. } => {
                let connect = inner.opts.get_connect_timeout();
                if connect.is_zero() {
                    connect
                } else {
                    connect + std::time::Duration::from_secs(1)
                }
            }
        };
        let core = OperationCore::new(client.clone(), timeout);
        if let Err(err) = client.add_pending(core.clone()) {
            ConnectionProxy::Referenced(slot).restore(inner);
            return Err(err);
        }
        let op = AdminOperation {
            core: core.clone(),
            slot,
            inner,
            verb,
            tx,
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

        if let Some(pre_operation) = self.inner.callbacks.pre_operation.as_mut() {
            pre_operation();
        }

        let outcome = {
            let inner = &mut *self.inner;
            inner.socket.set_operation(self.core.id());
            inner.socket.arm_timeout(self.core.timeout());
            let verb = &self.verb;
            drive_step(&self.core, &mut inner.socket, inner.holder.handle_mut(), |h| {
                verb.step(h)
            })
            .await
        };
        self.inner.socket.clear_operation();

        let key = self.inner.holder.key().clone();
        let result = match outcome {
            StepOutcome::Done => {
                let holder = &mut self.inner.holder;
                holder.clear_needs_reset();
                holder.mark_reusable();
                if let AdminVerb::ChangeUser {
                    user,
                    password,
                    database,
                } = &self.verb
                {
                    let rekeyed = holder.key().with_credentials(user, password, database);
                    holder.set_key(rekeyed);
                }
                Ok(())
            }
            StepOutcome::Failed(err) => Err(Error::QueryFailed {
                errno: err.errno,
                message: err.message,
                queries_executed: 0,
                key,
                status: self.inner.holder.handle().server_status(),
                elapsed: self.core.elapsed(),
            }),
            StepOutcome::SocketError(err) => Err(Error::QueryFailed {
                errno: cr::SERVER_LOST,
                message: format!("socket error: {err}"),
                queries_executed: 0,
                key,
                status: ServerStatus::default(),
                elapsed: self.core.elapsed(),
            }),
            StepOutcome::TimedOut => Err(Error::Timeout {
                elapsed: self.core.elapsed(),
            }),
            StepOutcome::Cancelled => Err(Error::Cancelled),
        };
        self.deliver(result);
    }

    fn deliver(self, result: Result<()>) {
        let AdminOperation {
            core,
            slot,
            mut inner,
            verb,
            tx,
        } = self;
        let client = core.client().clone();
        let key = inner.holder.key().clone();
        let elapsed = core.elapsed();

        if !core.try_complete() {
            ConnectionProxy::Referenced(slot).restore(inner);
            return;
        }

        match &result {
            Ok(()) => {
                client.stats().incr_succeeded_queries();
                client
                    .logger()
                    .log_query_success(&key, verb.log_sql(), elapsed);
            }
            Err(err) => {
                client.stats().incr_failed_queries(err.errno());
                client.logger().log_query_failure(&key, verb.log_sql(), err);
                inner.holder.mark_not_reusable();
            }
        }

        if let Some(post_operation) = inner.callbacks.post_operation.as_mut() {
            post_operation(&OperationReport {
                success: result.is_ok(),
                elapsed,
            });
        }

        ConnectionProxy::Referenced(slot).restore(inner);
        let _ = tx.send(result);
        core.finish();
    }
}

/// The reset issued while a connection is being destroyed, before its holder
/// is handed to the recycle callback.
///
/// This operation owns the dying connection's guts outright; on success the
/// freshly reset holder goes to the recycle callback, on any failure the
/// native handle is closed instead. The destructor that spawned it blocks on
/// the `done` signal.
pub(crate) struct RecycleResetOperation {
    core: Arc<OperationCore>,
    inner: Box<ConnectionInner>,
    recycle: Box<dyn FnOnce(ConnectionHolder) + Send>,
    done: oneshot::Sender<()>,
}

impl RecycleResetOperation {
    pub(crate) fn new(
        client: &Arc<ClientCore>,
        inner: Box<ConnectionInner>,
        recycle: Box<dyn FnOnce(ConnectionHolder) + Send>,
    ) -> (Self, oneshot::Receiver<()>) {
        let core = OperationCore::new(client.clone(), inner.opts.get_query_timeout());
        let (done, done_rx) = oneshot::channel();
        (
            Self {
                core,
                inner,
                recycle,
                done,
            },
            done_rx,
        )
    }

    pub(crate) fn core(&self) -> Arc<OperationCore> {
        self.core.clone()
    }

    pub(crate) fn spawn(self) {
        tokio::task::spawn_local(self.run());
    }

    async fn run(mut self) {
        let outcome = if self.core.begin_pending() {
            let inner = &mut *self.inner;
            inner.socket.set_operation(self.core.id());
            inner.socket.arm_timeout(self.core.timeout());
            let outcome =
                drive_step(&self.core, &mut inner.socket, inner.holder.handle_mut(), |h| {
                    h.reset()
                })
                .await;
            inner.socket.clear_operation();
            outcome
        } else {
            StepOutcome::Cancelled
        };

        let RecycleResetOperation {
            core,
            inner,
            recycle,
            done,
        } = self;
        let ConnectionInner { mut holder, .. } = *inner;

        if !core.try_complete() {
            let _ = done.send(());
            return;
        }

        match outcome {
            StepOutcome::Done => {
                debug!(operation = core.id(), key = %holder.key(), "reset before recycle succeeded");
                holder.clear_needs_reset();
                holder.mark_reusable();
                recycle(holder);
            }
            other => {
                debug!(operation = core.id(), outcome = ?other, "reset before recycle failed; closing handle");
                // Not recyclable in unknown session state; close natively.
                drop(holder);
            }
        }

        let _ = done.send(());
        core.finish();
    }
}
