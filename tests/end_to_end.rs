//! End-to-end scenarios: a real client and reactor against the scriptable
//! backend.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use squeal::testing::{ConnectScript, FakeBackend, FakeResultSet, QueryScript};
use squeal::{Client, ConnectionHolder, ConnectionOptions, Error, NoopLogger, NoopStats};

use common::{init_tracing, test_key, CountingLogger, CountingStats};

#[test]
fn connect_and_query() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    backend.script_query(
        "SELECT 1",
        QueryScript::Result(FakeResultSet::single_value("1", "1")),
    );
    let logger = Arc::new(CountingLogger::default());
    let client =
        Client::with_collaborators(backend.clone(), Arc::new(NoopStats), logger.clone());

    let mut conn = client
        .connect(test_key(), ConnectionOptions::new())
        .unwrap();
    let result = conn.query("SELECT 1").unwrap();

    assert_eq!(result.num_rows(), 1);
    let row = &result.rows()[0];
    assert_eq!(row.len(), 1);
    assert_eq!(row.columns(), ["1"]);
    assert_eq!(row.value(0).unwrap().as_ref(), b"1");
    assert_eq!(result.connection_key(), &test_key());

    drop(conn);
    client.shutdown();

    assert_eq!(logger.connection_successes(), 1);
    assert_eq!(logger.query_successes(), 1);
    assert_eq!(logger.connection_failures(), 0);
    assert_eq!(logger.query_failures(), 0);
}

#[test]
fn connect_timeout_against_unreachable_host() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    backend.script_connect(ConnectScript::Hang);
    let stats = Arc::new(CountingStats::default());
    let client = Client::with_collaborators(backend, stats.clone(), Arc::new(NoopLogger));

    let started = Instant::now();
    let err = client
        .connect(
            test_key(),
            ConnectionOptions::new().connect_timeout(Duration::from_millis(10)),
        )
        .unwrap_err();

    match err {
        Error::Timeout { elapsed } => assert!(elapsed >= Duration::from_millis(10)),
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_millis(10));
    assert_eq!(stats.failed_connections(), 1);

    client.shutdown();
}

#[test]
fn cancel_in_flight_query() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    backend.script_query("SELECT SLEEP(1)", QueryScript::Hang);
    let client = Client::new(backend);

    let mut conn = client
        .connect(test_key(), ConnectionOptions::new())
        .unwrap();
    let terminals = Arc::new(Mutex::new(0usize));
    {
        let terminals = terminals.clone();
        conn.set_post_operation_callback(move |_report| {
            *terminals.lock().unwrap() += 1;
        })
        .unwrap();
    }

    let fut = conn.begin_query("SELECT SLEEP(1)");
    std::thread::sleep(Duration::from_millis(50));
    // Idempotent: repeated requests collapse into one terminal transition.
    fut.cancel();
    fut.cancel();
    fut.cancel();

    match fut.wait() {
        Err(Error::Cancelled) => {}
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert_eq!(*terminals.lock().unwrap(), 1);
    assert!(!conn.reusable());

    drop(conn);
    client.shutdown();
}

#[test]
fn shutdown_drains_pending_connects() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    backend.script_connect(ConnectScript::Delay(Duration::from_millis(2)));
    let client = Client::new(backend.clone());

    // Futures are dropped immediately; the connections they would have
    // carried are discarded at completion.
    for _ in 0..100 {
        let _ = client.begin_connection(test_key(), ConnectionOptions::new());
    }
    // Shutdown's own invariant checks verify the pending set is empty and
    // the active-connection counter is zero once it returns.
    client.shutdown();

    assert!(backend.connects_started() <= 100);
}

#[test]
fn empty_multi_query_fails_without_protocol_activity() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    let client = Client::new(backend.clone());

    let mut conn = client
        .connect(test_key(), ConnectionOptions::new())
        .unwrap();
    match conn.multi_query(Vec::new()) {
        Err(Error::Client(msg)) => assert_eq!(msg, "Given vector of queries is empty"),
        other => panic!("expected a client error, got {other:?}"),
    }
    assert_eq!(backend.queries_started(), 0);

    drop(conn);
    client.shutdown();
}

#[test]
fn dying_connection_resets_before_recycle() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    backend.script_query(
        "SELECT 1",
        QueryScript::Result(FakeResultSet::single_value("1", "1")),
    );
    let client = Client::new(backend.clone());

    let mut conn = client
        .connect(
            test_key(),
            ConnectionOptions::new().reset_conn_before_close(true),
        )
        .unwrap();
    let recycled: Arc<Mutex<Option<ConnectionHolder>>> = Arc::new(Mutex::new(None));
    {
        let recycled = recycled.clone();
        conn.set_dying_callback(move |holder| {
            *recycled.lock().unwrap() = Some(holder);
        });
    }

    conn.query("SELECT 1").unwrap();
    assert_eq!(backend.resets(), 0);

    // Dropped from a non-reactor thread: the destructor schedules the reset,
    // blocks until it completes, and only then is the holder recycled.
    drop(conn);

    assert_eq!(backend.resets(), 1);
    let holder = recycled
        .lock()
        .unwrap()
        .take()
        .expect("holder was not handed to the recycle callback");
    assert!(holder.is_reusable());
    assert!(!holder.needs_reset_before_reuse());

    drop(holder);
    client.shutdown();
}

#[test]
fn new_operations_are_refused_after_shutdown() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    let client = Client::new(backend);
    client.shutdown();

    match client.connect(test_key(), ConnectionOptions::new()) {
        Err(Error::Client(msg)) => assert!(msg.contains("shutting down")),
        other => panic!("expected refusal, got {other:?}"),
    }
}

#[test]
fn connect_failure_carries_server_error() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    backend.script_connect(ConnectScript::Fail {
        errno: 1045,
        message: "Access denied for user".to_string(),
    });
    let stats = Arc::new(CountingStats::default());
    let logger = Arc::new(CountingLogger::default());
    let client = Client::with_collaborators(backend, stats.clone(), logger.clone());

    match client.connect(test_key(), ConnectionOptions::new()) {
        Err(Error::ConnectFailed { errno, message, key }) => {
            assert_eq!(errno, 1045);
            assert!(message.contains("Access denied"));
            assert_eq!(key, test_key());
        }
        other => panic!("expected a connect failure, got {other:?}"),
    }
    assert_eq!(stats.failed_connections(), 1);
    assert_eq!(logger.connection_failures(), 1);

    client.shutdown();
}
