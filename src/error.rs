use std::time::Duration;

use thiserror::Error;

use crate::options::ConnectionKey;
use crate::protocol::ServerStatus;

#[derive(Debug, Error)]
pub enum Error {
    /// The server rejected the connection attempt, or the transport failed
    /// while the handshake was still in progress.
    #[error("connect to {key} failed: [{errno}] {message}")]
    ConnectFailed {
        errno: u32,
        message: String,
        key: ConnectionKey,
    },
    /// A query, fetch or result-set advance failed on an established
    /// connection. `queries_executed` counts the statements that completed
    /// before the failure.
    #[error("query on {key} failed after {queries_executed} queries: [{errno}] {message}")]
    QueryFailed {
        errno: u32,
        message: String,
        queries_executed: usize,
        key: ConnectionKey,
        status: ServerStatus,
        elapsed: Duration,
    },
    #[error("operation timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },
    #[error("operation was cancelled")]
    Cancelled,
    /// The connection has no holder, or its protocol handle is no longer
    /// usable.
    #[error("invalid connection: {0}")]
    InvalidConnection(String),
    #[error("an operation is already in progress on this connection")]
    OperationInProgress,
    /// The reactor delivered an event to an operation in an illegal state.
    /// This is a programming bug; the delivery site panics with this value.
    #[error("operation event delivered in illegal state: {0}")]
    OperationState(String),
    /// An internal client invariant was violated, or a request was refused
    /// by the client itself rather than by the server.
    #[error("{0}")]
    Client(String),
}

impl Error {
    /// The MySQL error number carried by server-originated failures, `0` for
    /// failures that never reached the server (timeout, cancel, refusal).
    pub fn errno(&self) -> u32 {
        match self {
            Error::ConnectFailed { errno, .. } | Error::QueryFailed { errno, .. } => *errno,
            _ => 0,
        }
    }
}
