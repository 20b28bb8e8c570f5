//! Operation state machines.
//!
//! Every request the client can issue is an operation: a state machine that
//! owns or borrows a connection, drives the protocol handle until a terminal
//! outcome, and publishes exactly one result. One file per operation family,
//! with the shared state-machine core and drive loop here.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::client::ClientCore;
use crate::connection::{Connection, ConnectionInner};
use crate::protocol::{ProtocolHandle, RowStep, ServerError, Step};
use crate::result::Row;
use crate::socket_handler::{Actionable, SocketHandler};

pub(crate) mod connect;
pub(crate) mod query;
pub(crate) mod special;

pub(crate) const EMPTY_MULTI_QUERY: &str = "Given vector of queries is empty";

/// Lifecycle states of an operation.
///
/// `Unstarted` covers the window between construction and the reactor
/// executing the initial-step closure. `Cancelling` is a request flag: the
/// next reactor observation turns it into a terminal `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpState {
    Unstarted,
    Pending,
    Cancelling,
    Completed,
}

/// The part of an operation shared with cancellers and waiters on other
/// threads.
pub struct OperationCore {
    id: u64,
    client: Arc<ClientCore>,
    state: Mutex<OpState>,
    cancel_notify: Notify,
    in_pending_set: AtomicBool,
    timeout: Duration,
    created_at: Instant,
    started_at: Mutex<Option<Instant>>,
}

impl OperationCore {
    pub(crate) fn new(client: Arc<ClientCore>, timeout: Duration) -> Arc<Self> {
        let id = client.next_operation_id();
        Arc::new(Self {
            id,
            client,
            state: Mutex::new(OpState::Unstarted),
            cancel_notify: Notify::new(),
            in_pending_set: AtomicBool::new(false),
            timeout,
            created_at: Instant::now(),
            started_at: Mutex::new(None),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn client(&self) -> &Arc<ClientCore> {
        &self.client
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn state(&self) -> OpState {
        *self.state.lock().unwrap()
    }

    /// Time since the operation took its first step, falling back to its
    /// construction time if it never started.
    pub(crate) fn elapsed(&self) -> Duration {
        self.started_at
            .lock()
            .unwrap()
            .unwrap_or(self.created_at)
            .elapsed()
    }

    /// Requests cancellation. Idempotent, callable from any thread and any
    /// state; a completed operation is never resurrected.
    pub(crate) fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        match *state {
            OpState::Unstarted | OpState::Pending => {
                *state = OpState::Cancelling;
                drop(state);
                self.cancel_notify.notify_one();
            }
            OpState::Cancelling | OpState::Completed => {}
        }
    }

    pub(crate) fn is_cancelling(&self) -> bool {
        self.state() == OpState::Cancelling
    }

    /// Resolves once a cancel request lands. Returns immediately if one has
    /// already been observed.
    pub(crate) async fn cancelled(&self) {
        if self.is_cancelling() {
            return;
        }
        self.cancel_notify.notified().await;
    }

    /// `Unstarted → Pending` transition taken by the initial step on the
    /// reactor. Returns `false` when the operation was cancelled before it
    /// ever ran, in which case the caller completes it without touching the
    /// protocol.
    pub(crate) fn begin_pending(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == OpState::Unstarted {
            *state = OpState::Pending;
            *self.started_at.lock().unwrap() = Some(Instant::now());
            true
        } else {
            false
        }
    }

    /// The terminal transition. Returns `true` exactly once; a second
    /// completion attempt (cancel racing natural completion) is a no-op.
    pub(crate) fn try_complete(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == OpState::Completed {
            false
        } else {
            *state = OpState::Completed;
            true
        }
    }

    pub(crate) fn mark_in_pending_set(&self) {
        self.in_pending_set.store(true, Ordering::Release);
    }

    /// Claims responsibility for removal from the pending set. Used by the
    /// shutdown sweep so the operation's own completion does not schedule a
    /// second removal.
    pub(crate) fn take_pending_membership(&self) -> bool {
        self.in_pending_set.swap(false, Ordering::AcqRel)
    }

    /// Post-terminal bookkeeping: schedules this operation's removal from
    /// the pending set, unless the shutdown sweep already removed it.
    pub(crate) fn finish(&self) {
        if self.take_pending_membership() {
            self.client.defer_remove(self.id);
        }
    }

    /// Panics if a readiness or timeout event is being delivered to an
    /// operation that is not live. Reaching this is a programming bug in the
    /// core, never a recoverable condition.
    pub(crate) fn assert_dispatchable(&self) {
        let state = self.state();
        if matches!(state, OpState::Unstarted | OpState::Completed) {
            panic!(
                "{}",
                crate::Error::OperationState(format!(
                    "event delivered to operation {} in state {state:?}",
                    self.id
                ))
            );
        }
    }
}

impl std::fmt::Debug for OperationCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationCore")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// The operation's ownership relation to its connection.
///
/// `Owned` operations consumed the user-facing `Connection` and yield it
/// back inside their success value (or drop it on failure). `Referenced`
/// operations borrowed the guts of a caller-held `Connection` and return
/// them through the connection's return slot on any terminal outcome.
pub(crate) enum ConnectionProxy {
    Owned(Connection),
    Referenced(ReturnSlot),
}

/// The slot through which a `Referenced` operation hands a connection's guts
/// back to the façade that lent them out.
pub(crate) type ReturnSlot = Arc<Mutex<Option<Box<ConnectionInner>>>>;

impl ConnectionProxy {
    /// Returns the guts to their owner. For `Owned`, the reassembled
    /// `Connection` comes back to be embedded in the operation's result.
    pub(crate) fn restore(self, inner: Box<ConnectionInner>) -> Option<Connection> {
        match self {
            ConnectionProxy::Owned(mut conn) => {
                conn.put_back(inner);
                Some(conn)
            }
            ConnectionProxy::Referenced(slot) => {
                *slot.lock().unwrap() = Some(inner);
                None
            }
        }
    }
}

/// Terminal-or-continue outcome of driving one protocol step to completion.
#[derive(Debug)]
pub(crate) enum StepOutcome {
    Done,
    Failed(ServerError),
    Cancelled,
    TimedOut,
    SocketError(io::Error),
}

/// Re-invokes `step` until it stops reporting `Pending`, parking on socket
/// readiness in between. Observes cancellation at every iteration and the
/// armed timeout at every park.
pub(crate) async fn drive_step<F>(
    core: &OperationCore,
    socket: &mut SocketHandler,
    handle: &mut dyn ProtocolHandle,
    mut step: F,
) -> StepOutcome
where
    F: FnMut(&mut dyn ProtocolHandle) -> Step,
{
    loop {
        if core.is_cancelling() {
            return StepOutcome::Cancelled;
        }
        match step(handle) {
            Step::Done => return StepOutcome::Done,
            Step::Failed(err) => return StepOutcome::Failed(err),
            Step::Pending(wait) => {
                tokio::select! {
                    biased;
                    _ = core.cancelled() => return StepOutcome::Cancelled,
                    res = socket.actionable(core, handle, wait) => match res {
                        Ok(Actionable::Ready) => {}
                        Ok(Actionable::TimedOut) => return StepOutcome::TimedOut,
                        Err(err) => return StepOutcome::SocketError(err),
                    },
                }
            }
        }
    }
}

/// Outcome of driving one row fetch to completion.
#[derive(Debug)]
pub(crate) enum RowOutcome {
    Row(Row),
    Done,
    Cancelled,
    TimedOut,
    SocketError(io::Error),
}

/// Like [`drive_step`], for the row-fetch primitive, which cannot fail.
pub(crate) async fn drive_fetch_row(
    core: &OperationCore,
    socket: &mut SocketHandler,
    handle: &mut dyn ProtocolHandle,
) -> RowOutcome {
    loop {
        if core.is_cancelling() {
            return RowOutcome::Cancelled;
        }
        match handle.fetch_row() {
            RowStep::Row(row) => return RowOutcome::Row(row),
            RowStep::Done => return RowOutcome::Done,
            RowStep::Pending(wait) => {
                tokio::select! {
                    biased;
                    _ = core.cancelled() => return RowOutcome::Cancelled,
                    res = socket.actionable(core, handle, wait) => match res {
                        Ok(Actionable::Ready) => {}
                        Ok(Actionable::TimedOut) => return RowOutcome::TimedOut,
                        Err(err) => return RowOutcome::SocketError(err),
                    },
                }
            }
        }
    }
}
