//! A scriptable in-memory protocol backend.
//!
//! Stands in for a real nonblocking MySQL library in tests: connects and
//! queries resolve according to per-endpoint and per-statement scripts, and
//! every handle yields `Pending` at least once per command so the drive loop
//! and readiness plumbing are genuinely exercised. Delays are backed by the
//! reactor's timer; `Hang` never becomes ready, which is how timeout and
//! cancellation windows are opened.
//!
//! Scripts are keyed by the exact statement text. A multi-statement query is
//! split on `;` and each piece looked up independently; `Delay` and `Hang`
//! gates are honored for the first statement of a command (later statements
//! resolve immediately).

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Sleep;

use crate::options::{ConnectionKey, ConnectionOptions};
use crate::protocol::{
    ProtocolBackend, ProtocolHandle, RowStep, ServerError, ServerStatus, Step, Wait,
};
use crate::result::Row;

/// How a connect attempt resolves.
#[derive(Debug, Clone)]
pub enum ConnectScript {
    Ok,
    Fail { errno: u32, message: String },
    Delay(Duration),
    Hang,
}

/// How one statement resolves.
#[derive(Debug, Clone)]
pub enum QueryScript {
    Result(FakeResultSet),
    Fail { errno: u32, message: String },
    Delay { after: Duration, result: FakeResultSet },
    Hang,
}

/// One scripted result set.
#[derive(Debug, Clone, Default)]
pub struct FakeResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub rows_affected: u64,
}

impl FakeResultSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// A result with one row holding one column.
    pub fn single_value(column: &str, value: &str) -> Self {
        Self {
            columns: vec![column.to_string()],
            rows: vec![vec![Some(value.to_string())]],
            rows_affected: 0,
        }
    }

    /// A rowless result reporting `n` affected rows.
    pub fn affected(n: u64) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected: n,
        }
    }
}

#[derive(Default)]
struct Script {
    connect: Option<ConnectScript>,
    queries: HashMap<String, QueryScript>,
}

struct Shared {
    script: Mutex<Script>,
    connects_started: AtomicUsize,
    queries_started: AtomicUsize,
    resets: AtomicUsize,
    change_users: AtomicUsize,
}

/// The scriptable backend. Clone-cheap; all handles observe the same script
/// and feed the same counters.
pub struct FakeBackend {
    shared: Arc<Shared>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                script: Mutex::new(Script::default()),
                connects_started: AtomicUsize::new(0),
                queries_started: AtomicUsize::new(0),
                resets: AtomicUsize::new(0),
                change_users: AtomicUsize::new(0),
            }),
        }
    }

    /// Scripts every subsequent connect attempt. Unscripted connects
    /// succeed.
    pub fn script_connect(&self, script: ConnectScript) {
        self.shared.script.lock().unwrap().connect = Some(script);
    }

    /// Scripts the statement `sql`. Unscripted statements succeed with an
    /// empty result.
    pub fn script_query(&self, sql: impl Into<String>, script: QueryScript) {
        self.shared
            .script
            .lock()
            .unwrap()
            .queries
            .insert(sql.into(), script);
    }

    pub fn connects_started(&self) -> usize {
        self.shared.connects_started.load(Ordering::SeqCst)
    }

    pub fn queries_started(&self) -> usize {
        self.shared.queries_started.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.shared.resets.load(Ordering::SeqCst)
    }

    pub fn change_users(&self) -> usize {
        self.shared.change_users.load(Ordering::SeqCst)
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolBackend for FakeBackend {
    fn new_handle(&self) -> Box<dyn ProtocolHandle> {
        Box::new(FakeHandle::new(self.shared.clone()))
    }
}

enum Staged {
    Ok(FakeResultSet),
    Fail(ServerError),
}

struct CurrentResult {
    columns: Arc<[String]>,
    rows: VecDeque<Vec<Option<Bytes>>>,
    rows_affected: u64,
    yielded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Connect,
    Query,
    Reset,
    ChangeUser,
    NextResult,
}

struct FakeHandle {
    shared: Arc<Shared>,
    connected: bool,
    broken: bool,
    in_transaction: bool,
    active: Option<Verb>,
    pending_once: bool,
    hang: bool,
    delay: Option<Pin<Box<Sleep>>>,
    fail: Option<ServerError>,
    staged: VecDeque<Staged>,
    current: Option<CurrentResult>,
    last_affected: u64,
}

impl FakeHandle {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            connected: false,
            broken: false,
            in_transaction: false,
            active: None,
            pending_once: false,
            hang: false,
            delay: None,
            fail: None,
            staged: VecDeque::new(),
            current: None,
            last_affected: 0,
        }
    }

    /// Marks `verb` as the command in progress. True on the first call of a
    /// command, false on re-invocations while it is still pending.
    fn begin_verb(&mut self, verb: Verb) -> bool {
        if self.active == Some(verb) {
            return false;
        }
        self.active = Some(verb);
        self.pending_once = true;
        true
    }

    /// The shared not-ready-yet gates, in precedence order.
    fn gate(&mut self) -> Option<Step> {
        if self.hang {
            return Some(Step::Pending(Wait::Read));
        }
        if self.delay.is_some() {
            return Some(Step::Pending(Wait::Read));
        }
        if self.pending_once {
            self.pending_once = false;
            return Some(Step::Pending(Wait::Read));
        }
        None
    }

    fn finish_verb(&mut self) {
        self.active = None;
    }

    /// Completes the next staged statement: installs its result set or
    /// surfaces its error.
    fn advance_statement(&mut self) -> Step {
        self.finish_verb();
        match self.staged.pop_front() {
            Some(Staged::Ok(rs)) => {
                self.last_affected = rs.rows_affected;
                let columns: Arc<[String]> = rs.columns.into();
                let rows = rs
                    .rows
                    .into_iter()
                    .map(|row| {
                        row.into_iter()
                            .map(|v| v.map(Bytes::from))
                            .collect::<Vec<_>>()
                    })
                    .collect();
                self.current = Some(CurrentResult {
                    columns,
                    rows,
                    rows_affected: self.last_affected,
                    yielded: false,
                });
                Step::Done
            }
            Some(Staged::Fail(err)) => {
                self.current = None;
                // Client-range errors (lost connection and friends) kill the
                // session; server-side statement errors leave it usable.
                if err.errno >= 2000 && err.errno < 3000 {
                    self.broken = true;
                }
                Step::Failed(err)
            }
            None => {
                self.current = None;
                Step::Done
            }
        }
    }

    fn apply_session_effects(&mut self, statement: &str) {
        let upper = statement.trim().to_ascii_uppercase();
        if upper == "BEGIN" || upper == "START TRANSACTION" {
            self.in_transaction = true;
        } else if upper == "COMMIT" || upper == "ROLLBACK" {
            self.in_transaction = false;
        }
    }

    fn stage_query(&mut self, sql: &str) {
        let statements: Vec<String> = sql
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        let scripts: Vec<Option<QueryScript>> = {
            let script = self.shared.script.lock().unwrap();
            statements
                .iter()
                .map(|s| script.queries.get(s).cloned())
                .collect()
        };

        self.staged.clear();
        for (index, (statement, script)) in statements.iter().zip(scripts).enumerate() {
            self.apply_session_effects(statement);
            match script {
                Some(QueryScript::Result(rs)) => self.staged.push_back(Staged::Ok(rs)),
                Some(QueryScript::Fail { errno, message }) => self
                    .staged
                    .push_back(Staged::Fail(ServerError::new(errno, message))),
                Some(QueryScript::Delay { after, result }) => {
                    if index == 0 {
                        self.delay = Some(Box::pin(tokio::time::sleep(after)));
                    }
                    self.staged.push_back(Staged::Ok(result));
                }
                Some(QueryScript::Hang) => {
                    if index == 0 {
                        self.hang = true;
                    }
                    self.staged.push_back(Staged::Ok(FakeResultSet::empty()));
                }
                None => self.staged.push_back(Staged::Ok(FakeResultSet::empty())),
            }
        }
    }
}

impl ProtocolHandle for FakeHandle {
    fn try_connect(&mut self, _key: &ConnectionKey, _opts: &ConnectionOptions) -> Step {
        if self.connected {
            return Step::Done;
        }
        if self.begin_verb(Verb::Connect) {
            self.shared.connects_started.fetch_add(1, Ordering::SeqCst);
            let script = self.shared.script.lock().unwrap().connect.clone();
            match script.unwrap_or(ConnectScript::Ok) {
                ConnectScript::Ok => {}
                ConnectScript::Fail { errno, message } => {
                    self.fail = Some(ServerError::new(errno, message));
                }
                ConnectScript::Delay(after) => {
                    self.delay = Some(Box::pin(tokio::time::sleep(after)));
                    self.pending_once = false;
                }
                ConnectScript::Hang => self.hang = true,
            }
        }
        if let Some(err) = self.fail.take() {
            self.finish_verb();
            self.broken = true;
            return Step::Failed(err);
        }
        if let Some(gate) = self.gate() {
            return gate;
        }
        self.finish_verb();
        self.connected = true;
        Step::Done
    }

    fn run_query(&mut self, sql: &str) -> Step {
        if !self.connected || self.broken {
            return Step::Failed(ServerError::new(2006, "MySQL server has gone away"));
        }
        if self.begin_verb(Verb::Query) {
            self.shared.queries_started.fetch_add(1, Ordering::SeqCst);
            self.stage_query(sql);
        }
        if let Some(gate) = self.gate() {
            return gate;
        }
        self.advance_statement()
    }

    fn reset(&mut self) -> Step {
        if !self.connected || self.broken {
            return Step::Failed(ServerError::new(2006, "MySQL server has gone away"));
        }
        if self.begin_verb(Verb::Reset) {
            self.shared.resets.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(gate) = self.gate() {
            return gate;
        }
        self.finish_verb();
        self.in_transaction = false;
        self.staged.clear();
        self.current = None;
        Step::Done
    }

    fn change_user(&mut self, _user: &str, _password: &str, _database: &str) -> Step {
        if !self.connected || self.broken {
            return Step::Failed(ServerError::new(2006, "MySQL server has gone away"));
        }
        if self.begin_verb(Verb::ChangeUser) {
            self.shared.change_users.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(gate) = self.gate() {
            return gate;
        }
        self.finish_verb();
        self.in_transaction = false;
        self.staged.clear();
        self.current = None;
        Step::Done
    }

    fn next_result(&mut self) -> Step {
        if self.begin_verb(Verb::NextResult) {
            self.pending_once = true;
        }
        if let Some(gate) = self.gate() {
            return gate;
        }
        self.advance_statement()
    }

    fn use_result(&mut self) -> Result<(), ServerError> {
        Ok(())
    }

    fn fetch_row(&mut self) -> RowStep {
        match self.current.as_mut() {
            None => RowStep::Done,
            Some(current) => {
                if !current.yielded {
                    current.yielded = true;
                    return RowStep::Pending(Wait::Read);
                }
                match current.rows.pop_front() {
                    Some(values) => RowStep::Row(Row::new(current.columns.clone(), values)),
                    None => RowStep::Done,
                }
            }
        }
    }

    fn affected_rows(&self) -> u64 {
        self.current
            .as_ref()
            .map(|c| c.rows_affected)
            .unwrap_or(self.last_affected)
    }

    fn server_status(&self) -> ServerStatus {
        ServerStatus {
            in_transaction: self.in_transaction,
            more_results: !self.staged.is_empty(),
        }
    }

    fn ok(&self) -> bool {
        self.connected && !self.broken
    }

    fn poll_ready(&mut self, _wait: Wait, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.hang {
            // Never ready; only a timeout or cancellation ends the wait.
            return Poll::Pending;
        }
        if let Some(delay) = self.delay.as_mut() {
            match delay.as_mut().poll(cx) {
                Poll::Ready(()) => self.delay = None,
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }
}
