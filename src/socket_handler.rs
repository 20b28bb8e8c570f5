//! Per-connection reactor attachment: socket readiness and a single-shot
//! operation timeout.

use std::future::poll_fn;
use std::io;
use std::time::Duration;

use tokio::time::{self, Instant};

use crate::operation::OperationCore;
use crate::protocol::{ProtocolHandle, Wait};

/// What woke the bound operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Actionable {
    Ready,
    TimedOut,
}

/// Subscribes the current operation to socket readiness and arms its
/// timeout.
///
/// A socket handler is bound to at most one operation at a time; the binding
/// is set when an operation starts on the connection and cleared on its
/// terminal transition. The timeout is single-shot and covers the whole
/// operation, not an individual readiness wait.
#[derive(Debug, Default)]
pub(crate) struct SocketHandler {
    deadline: Option<Instant>,
    bound_operation: Option<u64>,
}

impl SocketHandler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_operation(&mut self, operation_id: u64) {
        self.bound_operation = Some(operation_id);
    }

    pub(crate) fn clear_operation(&mut self) {
        self.bound_operation = None;
        self.deadline = None;
    }

    /// Arms the single-shot timeout. A zero duration means no timeout.
    pub(crate) fn arm_timeout(&mut self, timeout: Duration) {
        self.deadline = if timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + timeout)
        };
    }

    /// Waits until the socket is ready for `wait` or the armed deadline
    /// fires, whichever comes first.
    ///
    /// Delivery to an operation that is not live is a contract violation and
    /// panics; see [`OperationCore::assert_dispatchable`].
    pub(crate) async fn actionable(
        &mut self,
        core: &OperationCore,
        handle: &mut dyn ProtocolHandle,
        wait: Wait,
    ) -> io::Result<Actionable> {
        if self.bound_operation != Some(core.id()) {
            panic!(
                "socket handler bound to {:?} but driven by operation {}",
                self.bound_operation,
                core.id()
            );
        }

        let ready = poll_fn(|cx| handle.poll_ready(wait, cx));
        let outcome = match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    res = ready => res.map(|()| Actionable::Ready),
                    _ = time::sleep_until(deadline) => Ok(Actionable::TimedOut),
                }
            }
            None => ready.await.map(|()| Actionable::Ready),
        };

        core.assert_dispatchable();
        outcome
    }
}
