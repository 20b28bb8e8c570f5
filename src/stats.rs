//! Statistics and logging collaborator interfaces.
//!
//! The core forwards one call per control point and aggregates nothing
//! itself. Both collaborators default to silent no-ops.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Error;
use crate::options::ConnectionKey;

/// Counter sink for operation outcomes and scheduling latency.
pub trait ClientStats: Send + Sync {
    fn incr_succeeded_queries(&self) {}

    fn incr_failed_queries(&self, _errno: u32) {}

    fn incr_failed_connections(&self, _errno: u32) {}

    /// One sample of the delay between enqueueing a closure for the reactor
    /// and the reactor picking it up.
    fn add_callback_delay_sample(&self, _delay: Duration) {}
}

/// Per-outcome log sink.
pub trait QueryLogger: Send + Sync {
    fn log_query_success(&self, _key: &ConnectionKey, _sql: &str, _elapsed: Duration) {}

    fn log_query_failure(&self, _key: &ConnectionKey, _sql: &str, _error: &Error) {}

    fn log_connection_success(&self, _key: &ConnectionKey, _elapsed: Duration) {}

    fn log_connection_failure(&self, _key: &ConnectionKey, _error: &Error) {}
}

/// The default stats collaborator: drops every sample.
#[derive(Debug, Default)]
pub struct NoopStats;

impl ClientStats for NoopStats {}

/// The default logger collaborator: logs nothing.
#[derive(Debug, Default)]
pub struct NoopLogger;

impl QueryLogger for NoopLogger {}

/// A logger collaborator that emits structured `tracing` events.
#[derive(Debug, Default)]
pub struct TracingLogger;

impl QueryLogger for TracingLogger {
    fn log_query_success(&self, key: &ConnectionKey, sql: &str, elapsed: Duration) {
        debug!(%key, sql, ?elapsed, "query succeeded");
    }

    fn log_query_failure(&self, key: &ConnectionKey, sql: &str, error: &Error) {
        warn!(%key, sql, %error, "query failed");
    }

    fn log_connection_success(&self, key: &ConnectionKey, elapsed: Duration) {
        debug!(%key, ?elapsed, "connection established");
    }

    fn log_connection_failure(&self, key: &ConnectionKey, error: &Error) {
        warn!(%key, %error, "connection failed");
    }
}
