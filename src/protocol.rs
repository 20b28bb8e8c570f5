//! The nonblocking protocol collaborator interface.
//!
//! The client core never speaks the MySQL wire protocol itself. It drives an
//! external implementation through [`ProtocolHandle`], a handle over one
//! native connection whose every primitive is nonblocking: each call either
//! completes, fails with a server error, or reports that it is waiting on
//! socket readiness. The core re-invokes the same primitive once the socket
//! becomes actionable, exactly like the `loop { match step() }` shape of a
//! hand-rolled nonblocking handshake.

use std::io;
use std::task::{Context, Poll};

use crate::options::{ConnectionKey, ConnectionOptions};
use crate::result::Row;

/// The socket readiness a pending protocol step is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Read,
    Write,
    ReadOrWrite,
}

/// A server-reported failure: the MySQL error number and message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub errno: u32,
    pub message: String,
}

impl ServerError {
    pub fn new(errno: u32, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
        }
    }
}

/// Outcome of one nonblocking protocol step.
#[derive(Debug)]
pub enum Step {
    Done,
    Pending(Wait),
    Failed(ServerError),
}

/// Outcome of one nonblocking row fetch.
///
/// Row fetching cannot fail by contract: a protocol implementation that hits
/// an error mid-result-set must surface it from the next `next_result` call
/// instead. The absence of an error variant here is that contract.
#[derive(Debug)]
pub enum RowStep {
    Row(Row),
    Pending(Wait),
    Done,
}

/// Session state flags reported by the server after each statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStatus {
    pub in_transaction: bool,
    pub more_results: bool,
}

/// One native protocol connection.
///
/// All methods except [`poll_ready`](ProtocolHandle::poll_ready) are called
/// exclusively on the reactor thread. A step that returns
/// [`Step::Pending`] will be re-invoked after the requested readiness is
/// observed; implementations must treat re-invocation as resumption, not as
/// a fresh request.
pub trait ProtocolHandle: Send {
    /// Advance the connect handshake for `key` under `opts`.
    fn try_connect(&mut self, key: &ConnectionKey, opts: &ConnectionOptions) -> Step;

    /// Advance sending `sql` and reading the first result header.
    fn run_query(&mut self, sql: &str) -> Step;

    /// Advance a `COM_RESET_CONNECTION`.
    fn reset(&mut self) -> Step;

    /// Advance a `COM_CHANGE_USER` to the given credentials.
    fn change_user(&mut self, user: &str, password: &str, database: &str) -> Step;

    /// Advance to the next result set of a multi-statement query.
    fn next_result(&mut self) -> Step;

    /// Open the current result set for row consumption. Synchronous.
    fn use_result(&mut self) -> Result<(), ServerError>;

    /// Fetch one row from the result set opened by `use_result`.
    fn fetch_row(&mut self) -> RowStep;

    /// Rows affected by the most recently completed statement.
    fn affected_rows(&self) -> u64;

    fn server_status(&self) -> ServerStatus;

    /// Whether the session is still usable for further operations.
    fn ok(&self) -> bool;

    /// Poll the underlying socket for `wait` readiness.
    ///
    /// This is the registration point with the reactor: a real
    /// implementation wraps its socket descriptor in an async registration
    /// (e.g. `AsyncFd`) and delegates to its readiness polls. An `Err` is
    /// treated by the core as a lost connection.
    fn poll_ready(&mut self, wait: Wait, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

/// Factory for protocol handles, plus the process-wide library setup.
pub trait ProtocolBackend: Send + Sync {
    /// One-time process-wide initialization. Called exactly once, before any
    /// handle exists; SSL initialization must precede library
    /// initialization inside this hook.
    fn initialize(&self) {}

    /// A fresh, unconnected handle.
    fn new_handle(&self) -> Box<dyn ProtocolHandle>;
}

/// Client-side error numbers used when a failure never reached the server.
pub(crate) mod cr {
    /// The TCP connection to the server was lost mid-operation.
    pub(crate) const SERVER_LOST: u32 = 2013;
}
