//! Shared collaborators and fixtures for the integration tests.
#![allow(dead_code)] // not every test binary uses every helper

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;
use std::time::Duration;

use squeal::{ClientStats, ConnectionKey, Error, QueryLogger};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Installs the fmt subscriber once per test binary, so `RUST_LOG` controls
/// reactor and operation tracing during test runs.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn test_key() -> ConnectionKey {
    ConnectionKey::new("localhost", 3306, "test", "u", "p")
}

/// Counts every logger control point.
#[derive(Debug, Default)]
pub struct CountingLogger {
    query_successes: AtomicUsize,
    query_failures: AtomicUsize,
    connection_successes: AtomicUsize,
    connection_failures: AtomicUsize,
}

impl CountingLogger {
    pub fn query_successes(&self) -> usize {
        self.query_successes.load(Ordering::SeqCst)
    }

    pub fn query_failures(&self) -> usize {
        self.query_failures.load(Ordering::SeqCst)
    }

    pub fn connection_successes(&self) -> usize {
        self.connection_successes.load(Ordering::SeqCst)
    }

    pub fn connection_failures(&self) -> usize {
        self.connection_failures.load(Ordering::SeqCst)
    }
}

impl QueryLogger for CountingLogger {
    fn log_query_success(&self, _key: &ConnectionKey, _sql: &str, _elapsed: Duration) {
        self.query_successes.fetch_add(1, Ordering::SeqCst);
    }

    fn log_query_failure(&self, _key: &ConnectionKey, _sql: &str, _error: &Error) {
        self.query_failures.fetch_add(1, Ordering::SeqCst);
    }

    fn log_connection_success(&self, _key: &ConnectionKey, _elapsed: Duration) {
        self.connection_successes.fetch_add(1, Ordering::SeqCst);
    }

    fn log_connection_failure(&self, _key: &ConnectionKey, _error: &Error) {
        self.connection_failures.fetch_add(1, Ordering::SeqCst);
    }
}

/// Counts every stats control point.
#[derive(Debug, Default)]
pub struct CountingStats {
    succeeded_queries: AtomicUsize,
    failed_queries: AtomicUsize,
    failed_connections: AtomicUsize,
    delay_samples: AtomicUsize,
}

impl CountingStats {
    pub fn succeeded_queries(&self) -> usize {
        self.succeeded_queries.load(Ordering::SeqCst)
    }

    pub fn failed_queries(&self) -> usize {
        self.failed_queries.load(Ordering::SeqCst)
    }

    pub fn failed_connections(&self) -> usize {
        self.failed_connections.load(Ordering::SeqCst)
    }

    pub fn delay_samples(&self) -> usize {
        self.delay_samples.load(Ordering::SeqCst)
    }
}

impl ClientStats for CountingStats {
    fn incr_succeeded_queries(&self) {
        self.succeeded_queries.fetch_add(1, Ordering::SeqCst);
    }

    fn incr_failed_queries(&self, _errno: u32) {
        self.failed_queries.fetch_add(1, Ordering::SeqCst);
    }

    fn incr_failed_connections(&self, _errno: u32) {
        self.failed_connections.fetch_add(1, Ordering::SeqCst);
    }

    fn add_callback_delay_sample(&self, _delay: Duration) {
        self.delay_samples.fetch_add(1, Ordering::SeqCst);
    }
}
