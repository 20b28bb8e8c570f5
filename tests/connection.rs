//! Connection façade behavior: transactions, callbacks, timeouts, session
//! maintenance and error surfaces.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use squeal::testing::{FakeBackend, FakeResultSet, QueryScript};
use squeal::{Client, Connection, ConnectionOptions, Error, QueryOutcome};

use common::{init_tracing, test_key};

fn client_and_conn(backend: &Arc<FakeBackend>) -> (Client, Connection) {
    let client = Client::new(backend.clone());
    let conn = client
        .connect(test_key(), ConnectionOptions::new())
        .unwrap();
    (client, conn)
}

#[test]
fn transaction_verbs_are_plain_queries() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    let (client, mut conn) = client_and_conn(&backend);

    conn.begin_transaction().unwrap();
    assert!(conn.in_transaction());
    conn.rollback_transaction().unwrap();
    assert!(!conn.in_transaction());

    // A user-submitted query of the same string is indistinguishable.
    let result = conn.query("BEGIN").unwrap();
    assert_eq!(result.num_rows(), 0);
    assert!(conn.in_transaction());
    conn.commit_transaction().unwrap();
    assert!(!conn.in_transaction());

    assert_eq!(backend.queries_started(), 4);

    drop(conn);
    client.shutdown();
}

#[test]
fn multi_query_collects_every_statement() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    backend.script_query(
        "SELECT a",
        QueryScript::Result(FakeResultSet {
            columns: vec!["a".to_string()],
            rows: vec![vec![Some("x".to_string())], vec![Some("y".to_string())]],
            rows_affected: 0,
        }),
    );
    backend.script_query("UPDATE t", QueryScript::Result(FakeResultSet::affected(3)));
    let (client, mut conn) = client_and_conn(&backend);

    let result = conn
        .multi_query(vec!["SELECT a".to_string(), "UPDATE t".to_string()])
        .unwrap();
    assert_eq!(result.num_queries_executed(), 2);
    assert_eq!(result.statements()[0].rows.len(), 2);
    assert_eq!(result.statements()[0].rows[0].value(0).unwrap().as_ref(), b"x");
    assert_eq!(result.statements()[1].rows_affected, 3);
    // The whole batch goes out as one protocol command.
    assert_eq!(backend.queries_started(), 1);

    drop(conn);
    client.shutdown();
}

#[test]
fn server_error_marks_connection_not_reusable_but_alive() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    backend.script_query(
        "SELECT boom",
        QueryScript::Fail {
            errno: 1064,
            message: "You have an error in your SQL syntax".to_string(),
        },
    );
    let (client, mut conn) = client_and_conn(&backend);

    match conn.query("SELECT boom") {
        Err(Error::QueryFailed {
            errno,
            queries_executed,
            key,
            ..
        }) => {
            assert_eq!(errno, 1064);
            assert_eq!(queries_executed, 0);
            assert_eq!(key, test_key());
        }
        other => panic!("expected a query failure, got {other:?}"),
    }
    assert!(!conn.reusable());
    // A statement error leaves the session itself usable.
    assert!(conn.ok());
    conn.query("SELECT 1").unwrap();

    drop(conn);
    client.shutdown();
}

#[test]
fn lost_connection_invalidates_the_handle() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    backend.script_query(
        "SELECT gone",
        QueryScript::Fail {
            errno: 2013,
            message: "Lost connection to MySQL server during query".to_string(),
        },
    );
    let (client, mut conn) = client_and_conn(&backend);

    assert!(matches!(
        conn.query("SELECT gone"),
        Err(Error::QueryFailed { errno: 2013, .. })
    ));
    assert!(!conn.ok());
    match conn.query("SELECT 1") {
        Err(Error::InvalidConnection(_)) => {}
        other => panic!("expected an invalid-connection error, got {other:?}"),
    }

    drop(conn);
    client.shutdown();
}

#[test]
fn second_operation_on_a_busy_connection_is_refused() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    backend.script_query("SELECT SLEEP(1)", QueryScript::Hang);
    let (client, mut conn) = client_and_conn(&backend);

    let handler = conn.stream_multi_query(vec!["SELECT SLEEP(1)".to_string()]).unwrap();
    match conn.query("SELECT 1") {
        Err(Error::OperationInProgress) => {}
        other => panic!("expected operation-in-progress, got {other:?}"),
    }

    // Dropping the handler cancels the hung operation and waits it out.
    drop(handler);
    assert!(!conn.reusable());

    drop(conn);
    client.shutdown();
}

#[test]
fn zero_timeout_means_no_timeout() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    backend.script_query(
        "SELECT slow",
        QueryScript::Delay {
            after: Duration::from_millis(50),
            result: FakeResultSet::single_value("v", "1"),
        },
    );
    let client = Client::new(backend);
    let mut conn = client
        .connect(
            test_key(),
            ConnectionOptions::new().query_timeout(Duration::ZERO),
        )
        .unwrap();

    let started = Instant::now();
    let result = conn.query("SELECT slow").unwrap();
    assert_eq!(result.num_rows(), 1);
    assert!(started.elapsed() >= Duration::from_millis(50));

    drop(conn);
    client.shutdown();
}

#[test]
fn positive_timeout_expires_at_its_deadline() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    backend.script_query(
        "SELECT slow",
        QueryScript::Delay {
            after: Duration::from_millis(200),
            result: FakeResultSet::empty(),
        },
    );
    let client = Client::new(backend);
    let mut conn = client
        .connect(
            test_key(),
            ConnectionOptions::new().query_timeout(Duration::from_millis(20)),
        )
        .unwrap();

    match conn.query("SELECT slow") {
        Err(Error::Timeout { elapsed }) => {
            assert!(elapsed >= Duration::from_millis(20));
            assert!(elapsed < Duration::from_millis(200));
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert!(!conn.reusable());

    drop(conn);
    client.shutdown();
}

#[test]
fn change_user_rewrites_the_connection_key() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    let (client, mut conn) = client_and_conn(&backend);

    conn.change_user("other_user", "other_pw", "other_db").unwrap();
    assert_eq!(backend.change_users(), 1);
    assert_eq!(conn.key().user(), "other_user");
    assert_eq!(conn.key().database(), "other_db");
    assert_eq!(conn.key().host(), "localhost");

    drop(conn);
    client.shutdown();
}

#[test]
fn reset_runs_as_its_own_operation() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    let (client, mut conn) = client_and_conn(&backend);

    conn.begin_transaction().unwrap();
    conn.reset().unwrap();
    assert_eq!(backend.resets(), 1);
    assert!(!conn.in_transaction());
    assert!(conn.reusable());

    drop(conn);
    client.shutdown();
}

#[test]
fn pre_and_post_query_callbacks_wrap_the_operation() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    backend.script_query(
        "SELECT 1",
        QueryScript::Result(FakeResultSet::single_value("1", "1")),
    );
    let (client, mut conn) = client_and_conn(&backend);

    let pre_ops = Arc::new(AtomicUsize::new(0));
    let pre_queries = Arc::new(AtomicUsize::new(0));
    let post_rows = Arc::new(AtomicUsize::new(0));
    {
        let pre_ops = pre_ops.clone();
        conn.set_pre_operation_callback(move || {
            pre_ops.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    {
        let pre_queries = pre_queries.clone();
        conn.set_pre_query_callback(move || {
            let pre_queries = pre_queries.clone();
            Box::pin(async move {
                pre_queries.fetch_add(1, Ordering::SeqCst);
            })
        })
        .unwrap();
    }
    {
        let post_rows = post_rows.clone();
        conn.set_post_query_callback(move |outcome| {
            if let QueryOutcome::Query(result) = &outcome {
                post_rows.store(result.num_rows(), Ordering::SeqCst);
            }
            outcome
        })
        .unwrap();
    }

    conn.query("SELECT 1").unwrap();
    assert_eq!(pre_ops.load(Ordering::SeqCst), 1);
    assert_eq!(pre_queries.load(Ordering::SeqCst), 1);
    assert_eq!(post_rows.load(Ordering::SeqCst), 1);

    drop(conn);
    client.shutdown();
}

#[test]
fn owned_future_query_returns_the_connection() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    backend.script_query(
        "SELECT 1",
        QueryScript::Result(FakeResultSet::single_value("1", "1")),
    );
    let (client, conn) = client_and_conn(&backend);

    let (conn, result) = conn.query_future("SELECT 1").wait().unwrap();
    assert_eq!(result.num_rows(), 1);
    assert!(conn.ok());

    // The returned connection is immediately usable for the next operation.
    let (conn, result) = conn.query_future("SELECT 1").wait().unwrap();
    assert_eq!(result.num_rows(), 1);

    drop(conn);
    client.shutdown();
}

#[test]
fn blocking_wait_is_refused_on_the_reactor_thread() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    let client = Arc::new(Client::new(backend));

    let (tx, rx) = std::sync::mpsc::channel();
    let inner = client.clone();
    client.run_in_thread(move || {
        let outcome = inner.connect(test_key(), ConnectionOptions::new());
        tx.send(outcome).unwrap();
    });
    match rx.recv().unwrap() {
        Err(Error::Client(msg)) => assert!(msg.contains("async context")),
        other => panic!("expected a refusal, got {other:?}"),
    }

    client.shutdown();
}
