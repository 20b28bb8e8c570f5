//! An asynchronous MySQL client.
//!
//! All network I/O is driven by a single background reactor thread; results
//! come back through blocking waits or deferred [`DbFuture`] completions.
//! The MySQL wire protocol itself is an external collaborator plugged in
//! through [`ProtocolBackend`]; this crate owns the operation scheduler, the
//! connection state machine, and the shutdown protocol around them.

pub mod client;
pub mod connection;
pub mod error;
pub mod future;
pub mod holder;
mod operation;
pub mod options;
pub mod protocol;
pub mod result;
mod socket_handler;
pub mod stats;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::Client;
pub use connection::{Connection, OperationReport, PreQueryGate};
pub use error::Error;
pub use future::DbFuture;
pub use holder::ConnectionHolder;
pub use options::{ConnectionKey, ConnectionOptions, SslOptions};
pub use protocol::{
    ProtocolBackend, ProtocolHandle, RowStep, ServerError, ServerStatus, Step, Wait,
};
pub use result::{
    DbMultiQueryResult, DbQueryResult, QueryOutcome, Row, StatementResult, StreamHandler,
    StreamItem,
};
pub use stats::{ClientStats, NoopLogger, NoopStats, QueryLogger, TracingLogger};

pub const DEFAULT_PORT: u16 = 3306;
pub const DEFAULT_HOST: &str = "localhost";

pub type Result<T> = std::result::Result<T, crate::error::Error>;
