//! Streaming multi-query behavior.

mod common;

use std::sync::Arc;

use squeal::testing::{FakeBackend, FakeResultSet, QueryScript};
use squeal::{Client, ConnectionOptions, Error, StreamItem};

use common::{init_tracing, test_key};

#[test]
fn rows_and_statement_boundaries_arrive_in_order() {
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
    let client = Client::new(backend);
    let mut conn = client
        .connect(test_key(), ConnectionOptions::new())
        .unwrap();

    let mut handler = conn
        .stream_multi_query(vec!["SELECT a".to_string(), "UPDATE t".to_string()])
        .unwrap();

    match handler.next().unwrap() {
        Some(StreamItem::Row(row)) => assert_eq!(row.value(0).unwrap().as_ref(), b"x"),
        other => panic!("expected first row, got {other:?}"),
    }
    match handler.next().unwrap() {
        Some(StreamItem::Row(row)) => assert_eq!(row.value(0).unwrap().as_ref(), b"y"),
        other => panic!("expected second row, got {other:?}"),
    }
    match handler.next().unwrap() {
        Some(StreamItem::QueryEnd { rows_affected, status }) => {
            assert_eq!(rows_affected, 0);
            assert!(status.more_results);
        }
        other => panic!("expected first boundary, got {other:?}"),
    }
    match handler.next().unwrap() {
        Some(StreamItem::QueryEnd { rows_affected, status }) => {
            assert_eq!(rows_affected, 3);
            assert!(!status.more_results);
        }
        other => panic!("expected second boundary, got {other:?}"),
    }
    assert!(handler.next().unwrap().is_none());
    drop(handler);

    // The connection is whole again once the stream has ended.
    assert!(conn.reusable());
    conn.query("SELECT 1").unwrap();

    drop(conn);
    client.shutdown();
}

#[test]
fn early_drop_cancels_and_waits_for_the_operation() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    backend.script_query("SELECT SLEEP(1)", QueryScript::Hang);
    let client = Client::new(backend);
    let mut conn = client
        .connect(test_key(), ConnectionOptions::new())
        .unwrap();

    let handler = conn
        .stream_multi_query(vec!["SELECT SLEEP(1)".to_string()])
        .unwrap();
    // Dropping before the stream ends blocks until the cancelled operation
    // has fully wound down and returned the connection's guts.
    drop(handler);

    assert!(!conn.reusable());

    drop(conn);
    client.shutdown();
}

#[test]
fn stream_failure_surfaces_the_server_error() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    backend.script_query(
        "SELECT boom",
        QueryScript::Fail {
            errno: 1064,
            message: "syntax error".to_string(),
        },
    );
    let client = Client::new(backend);
    let mut conn = client
        .connect(test_key(), ConnectionOptions::new())
        .unwrap();

    let mut handler = conn
        .stream_multi_query(vec!["SELECT boom".to_string()])
        .unwrap();
    match handler.next() {
        Err(Error::QueryFailed { errno, .. }) => assert_eq!(errno, 1064),
        other => panic!("expected a query failure, got {other:?}"),
    }
    // The stream is finished after the error.
    assert!(handler.next().unwrap().is_none());
    drop(handler);

    drop(conn);
    client.shutdown();
}
