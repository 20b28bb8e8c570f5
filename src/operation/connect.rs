//! The connect operation: opens a native session and assembles a
//! [`Connection`] around it.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::debug;

use crate::client::ClientCore;
use crate::connection::Connection;
use crate::error::Error;
use crate::future::DbFuture;
use crate::holder::ConnectionHolder;
use crate::options::{ConnectionKey, ConnectionOptions};
use crate::protocol::cr;
use crate::socket_handler::SocketHandler;
use crate::Result;

use super::{drive_step, OperationCore, StepOutcome};

pub(crate) struct ConnectOperation {
    core: Arc<OperationCore>,
    key: ConnectionKey,
    opts: ConnectionOptions,
    /// Registration in the client's active-connection set, made before the
    /// operation runs so shutdown waits for connects already in flight.
    conn_id: u64,
    tx: oneshot::Sender<Result<Connection>>,
}

impl ConnectOperation {
    /// Registers and schedules a connect against `key`, returning the
    /// deferred connection.
    pub(crate) fn begin(
        client: &Arc<ClientCore>,
        key: ConnectionKey,
        opts: ConnectionOptions,
    ) -> DbFuture<Connection> {
        let core = OperationCore::new(client.clone(), opts.get_connect_timeout());
        if let Err(err) = client.add_pending(core.clone()) {
            return DbFuture::ready(Err(err));
        }
        let conn_id = client.register_connection();

        let (tx, rx) = oneshot::channel();
        let op = ConnectOperation {
            core: core.clone(),
            key,
            opts,
            conn_id,
            tx,
        };
        if !client.run_in_thread(move || op.spawn()) {
            client.abort_pending(&core);
            client.unregister_connection(conn_id);
            return DbFuture::ready(Err(Error::Client(
                "client reactor is no longer running".to_string(),
            )));
        }
        DbFuture::new(rx).with_core(core)
    }

    pub(crate) fn spawn(self) {
        tokio::task::spawn_local(self.run());
    }

    async fn run(self) {
        let ConnectOperation {
            core,
            key,
            opts,
            conn_id,
            tx,
        } = self;
        let client = core.client().clone();

        if !core.begin_pending() {
            // Cancelled before the first protocol step, typically by a
            // shutdown sweep.
            client.unregister_connection(conn_id);
            complete(&core, &client, &key, tx, Err(Error::Cancelled));
            return;
        }
        debug!(operation = core.id(), %key, "connect started");

        let mut handle = client.backend().new_handle();
        let mut socket = SocketHandler::new();
        socket.set_operation(core.id());
        socket.arm_timeout(core.timeout());

        let outcome = drive_step(&core, &mut socket, handle.as_mut(), |h| {
            h.try_connect(&key, &opts)
        })
        .await;
        socket.clear_operation();

        let result = match outcome {
            StepOutcome::Done => {
                let holder = ConnectionHolder::new(handle, key.clone());
                Ok(Connection::assemble(client.clone(), conn_id, holder, opts))
            }
            StepOutcome::Failed(err) => {
                client.stats().incr_failed_connections(err.errno);
                client.unregister_connection(conn_id);
                Err(Error::ConnectFailed {
                    errno: err.errno,
                    message: err.message,
                    key: key.clone(),
                })
            }
            StepOutcome::TimedOut => {
                client.stats().incr_failed_connections(0);
                client.unregister_connection(conn_id);
                Err(Error::Timeout {
                    elapsed: core.elapsed(),
                })
            }
            StepOutcome::Cancelled => {
                client.unregister_connection(conn_id);
                Err(Error::Cancelled)
            }
            StepOutcome::SocketError(io) => {
                client.stats().incr_failed_connections(cr::SERVER_LOST);
                client.unregister_connection(conn_id);
                Err(Error::ConnectFailed {
                    errno: cr::SERVER_LOST,
                    message: format!("socket error during connect: {io}"),
                    key: key.clone(),
                })
            }
        };
        complete(&core, &client, &key, tx, result);
    }
}

fn complete(
    core: &OperationCore,
    client: &ClientCore,
    key: &ConnectionKey,
    tx: oneshot::Sender<Result<Connection>>,
    result: Result<Connection>,
) {
    if !core.try_complete() {
        return;
    }
    match &result {
        Ok(_) => client.logger().log_connection_success(key, core.elapsed()),
        Err(err) => client.logger().log_connection_failure(key, err),
    }
    // A dropped receiver discards the connection, whose own drop unregisters
    // it from the active set.
    let _ = tx.send(result);
    core.finish();
}
