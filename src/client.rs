//! The process-facing front door: reactor thread ownership, operation
//! submission, and orderly shutdown.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Once, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::{debug, error, info};

use crate::connection::Connection;
use crate::error::Error;
use crate::future::DbFuture;
use crate::operation::connect::ConnectOperation;
use crate::operation::{OpState, OperationCore};
use crate::options::{ConnectionKey, ConnectionOptions};
use crate::protocol::ProtocolBackend;
use crate::result::{DbMultiQueryResult, DbQueryResult};
use crate::stats::{ClientStats, NoopLogger, NoopStats, QueryLogger};
use crate::Result;

/// One closure enqueued for the reactor, stamped for latency accounting.
struct Job {
    enqueued_at: Instant,
    run: Box<dyn FnOnce() + Send>,
}

#[derive(Default)]
struct PendingSet {
    ops: HashMap<u64, Arc<OperationCore>>,
    block_new: bool,
}

#[derive(Default)]
struct ConnRegistry {
    open: HashSet<u64>,
    count: usize,
}

/// State shared between the reactor thread, submitter threads and every
/// operation.
///
/// Lock discipline: the pending-set lock and the connection-registry lock
/// are never held together; the shutdown drain takes them strictly in
/// sequence, releasing the first before touching the second.
pub(crate) struct ClientCore {
    job_tx: mpsc::UnboundedSender<Job>,
    reactor_thread: OnceLock<ThreadId>,
    pending: Mutex<PendingSet>,
    to_remove: Mutex<Vec<u64>>,
    conns: Mutex<ConnRegistry>,
    conns_quiesced: Condvar,
    reactor_exit: AtomicBool,
    shutdown_started: AtomicBool,
    next_operation_id: AtomicU64,
    next_connection_id: AtomicU64,
    stats: Arc<dyn ClientStats>,
    logger: Arc<dyn QueryLogger>,
    backend: Arc<dyn ProtocolBackend>,
}

impl ClientCore {
    pub(crate) fn next_operation_id(&self) -> u64 {
        self.next_operation_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn stats(&self) -> &dyn ClientStats {
        self.stats.as_ref()
    }

    pub(crate) fn logger(&self) -> &dyn QueryLogger {
        self.logger.as_ref()
    }

    pub(crate) fn backend(&self) -> &dyn ProtocolBackend {
        self.backend.as_ref()
    }

    pub(crate) fn on_reactor_thread(&self) -> bool {
        self.reactor_thread.get() == Some(&thread::current().id())
    }

    /// Enqueues `f` for the reactor, or runs it inline when already there.
    /// Returns `true` on successful dispatch.
    pub(crate) fn run_in_thread(&self, f: impl FnOnce() + Send + 'static) -> bool {
        if self.on_reactor_thread() {
            f();
            return true;
        }
        self.job_tx
            .send(Job {
                enqueued_at: Instant::now(),
                run: Box::new(f),
            })
            .is_ok()
    }

    /// Wakes the reactor without doing any work, so it notices exit flags
    /// and pending removals.
    fn nudge(&self) {
        let _ = self.job_tx.send(Job {
            enqueued_at: Instant::now(),
            run: Box::new(|| {}),
        });
    }

    pub(crate) fn ensure_accepting(&self) -> Result<()> {
        if self.pending.lock().unwrap().block_new {
            Err(Error::Client("client is shutting down".to_string()))
        } else {
            Ok(())
        }
    }

    pub(crate) fn accepting_new_operations(&self) -> bool {
        !self.pending.lock().unwrap().block_new
    }

    /// Registers an operation in the pending set, refusing once new
    /// operations are blocked by shutdown.
    pub(crate) fn add_pending(&self, core: Arc<OperationCore>) -> Result<()> {
        let mut pending = self.pending.lock().unwrap();
        if pending.block_new {
            return Err(Error::Client("client is shutting down".to_string()));
        }
        core.mark_in_pending_set();
        pending.ops.insert(core.id(), core);
        Ok(())
    }

    /// Registers an operation even while new operations are blocked. Only
    /// the dying-connection recycle reset uses this, from the reactor,
    /// immediately before running the operation.
    pub(crate) fn add_pending_unchecked(&self, core: Arc<OperationCore>) {
        let mut pending = self.pending.lock().unwrap();
        core.mark_in_pending_set();
        pending.ops.insert(core.id(), core);
    }

    /// Backs out an operation whose initial dispatch never happened.
    pub(crate) fn abort_pending(&self, core: &OperationCore) {
        if core.take_pending_membership() {
            self.pending.lock().unwrap().ops.remove(&core.id());
        }
    }

    /// Queues a completed operation for removal from the pending set and
    /// wakes the reactor to harvest it.
    pub(crate) fn defer_remove(&self, operation_id: u64) {
        self.to_remove.lock().unwrap().push(operation_id);
        self.nudge();
    }

    /// Harvests completed operations. Removing an operation that is not in
    /// the pending set is a programming bug and fatal.
    fn cleanup_completed_operations(&self) {
        let harvested: Vec<u64> = std::mem::take(&mut *self.to_remove.lock().unwrap());
        if harvested.is_empty() {
            return;
        }
        let mut pending = self.pending.lock().unwrap();
        for id in harvested {
            if pending.ops.remove(&id).is_none() {
                panic!("operation {id} removed from the pending set twice");
            }
        }
    }

    /// Records a new live connection and returns its registry id.
    pub(crate) fn register_connection(&self) -> u64 {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let mut reg = self.conns.lock().unwrap();
        reg.open.insert(id);
        reg.count += 1;
        id
    }

    pub(crate) fn unregister_connection(&self, id: u64) {
        let mut reg = self.conns.lock().unwrap();
        if reg.open.remove(&id) {
            reg.count -= 1;
            if reg.count == 0 {
                self.conns_quiesced.notify_all();
            }
        }
    }

    /// One shutdown sweep: cancel everything that never started, then wait
    /// for every issued connection to be destroyed.
    fn drain(&self, block_new: bool) {
        let swept: Vec<Arc<OperationCore>> = {
            let mut pending = self.pending.lock().unwrap();
            if block_new {
                pending.block_new = true;
            }
            let unstarted: Vec<u64> = pending
                .ops
                .iter()
                .filter(|(_, op)| op.state() == OpState::Unstarted)
                .map(|(id, _)| *id)
                .collect();
            unstarted
                .into_iter()
                .filter_map(|id| {
                    let op = pending.ops.remove(&id)?;
                    // The sweep owns the removal; the operation's own
                    // completion must not schedule a second one.
                    op.take_pending_membership();
                    Some(op)
                })
                .collect()
        };
        // Cancelled outside the lock: completion may fire user callbacks.
        for op in swept {
            op.cancel();
        }

        let mut reg = self.conns.lock().unwrap();
        while reg.count > 0 {
            reg = self.conns_quiesced.wait(reg).unwrap();
        }
    }
}

/// An asynchronous MySQL client.
///
/// Owns one reactor thread that drives every protocol call, state
/// transition and completion for the operations submitted through it. Any
/// thread may submit work; only the explicit blocking calls park their
/// caller.
pub struct Client {
    core: Arc<ClientCore>,
    reactor: Mutex<Option<thread::JoinHandle<()>>>,
}

static NEXT_CLIENT: AtomicUsize = AtomicUsize::new(0);
static PROTOCOL_INIT: Once = Once::new();
static DEFAULT_CLIENT: OnceLock<Client> = OnceLock::new();

impl Client {
    /// A client with silent stats and logging collaborators.
    pub fn new(backend: Arc<dyn ProtocolBackend>) -> Self {
        Self::with_collaborators(backend, Arc::new(NoopStats), Arc::new(NoopLogger))
    }

    /// A client forwarding to the given stats and logging collaborators.
    pub fn with_collaborators(
        backend: Arc<dyn ProtocolBackend>,
        stats: Arc<dyn ClientStats>,
        logger: Arc<dyn QueryLogger>,
    ) -> Self {
        // Process-wide protocol library setup (SSL first, inside the hook)
        // happens exactly once, before any handle can exist.
        PROTOCOL_INIT.call_once(|| backend.initialize());

        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let core = Arc::new(ClientCore {
            job_tx,
            reactor_thread: OnceLock::new(),
            pending: Mutex::new(PendingSet::default()),
            to_remove: Mutex::new(Vec::new()),
            conns: Mutex::new(ConnRegistry::default()),
            conns_quiesced: Condvar::new(),
            reactor_exit: AtomicBool::new(false),
            shutdown_started: AtomicBool::new(false),
            next_operation_id: AtomicU64::new(0),
            next_connection_id: AtomicU64::new(0),
            stats,
            logger,
            backend,
        });

        let index = NEXT_CLIENT.fetch_add(1, Ordering::Relaxed);
        let reactor = {
            let core = core.clone();
            thread::Builder::new()
                .name(format!("squeal-reactor-{index}"))
                .spawn(move || reactor_main(core, job_rx))
                .expect("failed to spawn reactor thread")
        };

        Self {
            core,
            reactor: Mutex::new(Some(reactor)),
        }
    }

    /// The lazily created process-wide default client. `None` until
    /// [`initialize_default`](Client::initialize_default) has run.
    pub fn default_instance() -> Option<&'static Client> {
        DEFAULT_CLIENT.get()
    }

    /// Creates the process-wide default client on first call; later calls
    /// return the existing instance and ignore `backend`.
    pub fn initialize_default(backend: Arc<dyn ProtocolBackend>) -> &'static Client {
        DEFAULT_CLIENT.get_or_init(|| Client::new(backend))
    }

    pub(crate) fn core(&self) -> &Arc<ClientCore> {
        &self.core
    }

    /// Opens a connection to `key`, resolving once the handshake completes.
    pub fn begin_connection(&self, key: ConnectionKey, opts: ConnectionOptions) -> DbFuture<Connection> {
        ConnectOperation::begin(&self.core, key, opts)
    }

    /// Opens a connection to `key`, blocking until it is established.
    pub fn connect(&self, key: ConnectionKey, opts: ConnectionOptions) -> Result<Connection> {
        self.begin_connection(key, opts).wait()
    }

    /// Starts a query on `conn` without waiting for its result.
    pub fn begin_query(
        &self,
        conn: &mut Connection,
        sql: impl Into<String>,
    ) -> DbFuture<DbQueryResult> {
        conn.begin_query(sql)
    }

    pub fn begin_multi_query(
        &self,
        conn: &mut Connection,
        queries: Vec<String>,
    ) -> DbFuture<DbMultiQueryResult> {
        conn.begin_multi_query(queries)
    }

    pub fn begin_reset(&self, conn: &mut Connection) -> DbFuture<()> {
        conn.begin_reset()
    }

    pub fn begin_change_user(
        &self,
        conn: &mut Connection,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> DbFuture<()> {
        conn.begin_change_user(user, password, database)
    }

    /// Enqueues `f` for execution on the reactor thread, preserving FIFO
    /// order with other enqueues from this thread. Runs inline when called
    /// from the reactor itself. Returns `true` on successful dispatch.
    pub fn run_in_thread(&self, f: impl FnOnce() + Send + 'static) -> bool {
        self.core.run_in_thread(f)
    }

    /// Drains in-flight work and stops the reactor. Idempotent.
    ///
    /// Two sweeps: the first cancels never-started operations and waits for
    /// every issued connection to be destroyed while still admitting the
    /// operations that destruction spawns (recycle resets); the second
    /// repeats that with new operations blocked. Must not be called from
    /// the reactor thread; doing so detaches the reactor and logs an error
    /// instead of self-joining.
    pub fn shutdown(&self) {
        if self.core.shutdown_started.swap(true, Ordering::SeqCst) {
            debug!("client shutdown requested again; ignoring");
            return;
        }

        if self.core.on_reactor_thread() {
            error!("Client::shutdown called from the reactor thread; detaching the reactor");
            self.core.reactor_exit.store(true, Ordering::Release);
            self.core.nudge();
            // Dropping the handle detaches the thread.
            *self.reactor.lock().unwrap() = None;
            return;
        }

        info!("client shutting down");
        self.core.drain(false);
        self.core.drain(true);

        self.core.reactor_exit.store(true, Ordering::Release);
        self.core.nudge();
        if let Some(handle) = self.reactor.lock().unwrap().take() {
            if let Err(panic) = handle.join() {
                std::panic::resume_unwind(panic);
            }
        }
        // The reactor is gone; harvest whatever completed right at exit.
        self.core.cleanup_completed_operations();

        let reg = self.core.conns.lock().unwrap();
        assert!(
            reg.count == 0 && reg.open.is_empty(),
            "connections still open after shutdown: {}",
            reg.count
        );
        drop(reg);
        let pending = self.core.pending.lock().unwrap();
        assert!(
            pending.ops.is_empty(),
            "pending set not empty after shutdown: {} operations",
            pending.ops.len()
        );
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if thread::panicking() {
            return;
        }
        self.shutdown();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

/// The reactor: a current-thread runtime on a dedicated OS thread, running
/// enqueued jobs and the operation tasks they spawn until told to exit.
fn reactor_main(core: Arc<ClientCore>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    let _ = core.reactor_thread.set(thread::current().id());
    debug!("reactor thread started");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build reactor runtime");
    let local = LocalSet::new();

    local.block_on(&runtime, async {
        while let Some(job) = jobs.recv().await {
            core.stats.add_callback_delay_sample(job.enqueued_at.elapsed());
            (job.run)();
            core.cleanup_completed_operations();
            if core.reactor_exit.load(Ordering::Acquire) {
                break;
            }
        }
    });
    debug!("reactor thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn shutdown_twice_is_a_noop() {
        let client = Client::new(Arc::new(FakeBackend::new()));
        client.shutdown();
        client.shutdown();
    }

    #[test]
    fn run_in_thread_executes_in_fifo_order() {
        let client = Client::new(Arc::new(FakeBackend::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        for i in 0..10 {
            let seen = seen.clone();
            let done_tx = done_tx.clone();
            assert!(client.run_in_thread(move || {
                seen.lock().unwrap().push(i);
                if i == 9 {
                    done_tx.send(()).unwrap();
                }
            }));
        }
        done_rx.recv().unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
        client.shutdown();
    }

    #[test]
    fn submitting_from_the_reactor_uses_the_direct_path() {
        let client = Arc::new(Client::new(Arc::new(FakeBackend::new())));
        let (tx, rx) = std::sync::mpsc::channel();
        let inner = client.clone();
        client.run_in_thread(move || {
            // Already on the reactor: this nested dispatch must run inline,
            // before run_in_thread returns.
            let ran = Arc::new(AtomicUsize::new(0));
            let observed = ran.clone();
            let accepted = inner.run_in_thread(move || {
                observed.fetch_add(1, Ordering::SeqCst);
            });
            tx.send(accepted && ran.load(Ordering::SeqCst) == 1).unwrap();
        });
        assert!(rx.recv().unwrap());
        client.shutdown();
    }

    #[test]
    fn shutdown_from_the_reactor_detaches_instead_of_joining() {
        let client = Arc::new(Client::new(Arc::new(FakeBackend::new())));
        let (tx, rx) = std::sync::mpsc::channel();
        let inner = client.clone();
        client.run_in_thread(move || {
            // Self-joining would deadlock; this must detach and return.
            inner.shutdown();
            tx.send(()).unwrap();
        });
        rx.recv().unwrap();
        // The second call observes the idempotency guard.
        client.shutdown();
    }

    #[test]
    fn scheduling_latency_is_sampled() {
        #[derive(Default)]
        struct CountingStats(AtomicUsize);
        impl ClientStats for CountingStats {
            fn add_callback_delay_sample(&self, _delay: std::time::Duration) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let stats = Arc::new(CountingStats::default());
        let client = Client::with_collaborators(
            Arc::new(FakeBackend::new()),
            stats.clone(),
            Arc::new(crate::stats::NoopLogger),
        );
        let (tx, rx) = std::sync::mpsc::channel();
        client.run_in_thread(move || tx.send(()).unwrap());
        rx.recv().unwrap();
        assert!(stats.0.load(Ordering::SeqCst) >= 1);
        client.shutdown();
    }
}
