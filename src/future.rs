//! Bridges between operation completion and the calling thread.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::Error;
use crate::operation::OperationCore;
use crate::Result;

/// Refuses a blocking wait from any thread that is executing inside an async
/// runtime: the reactor thread above all, but also any caller's own runtime,
/// where parking the thread would stall unrelated tasks.
pub(crate) fn blocking_guard() -> Result<()> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(Error::Client(
            "blocking wait inside an async context; use the future interface instead".to_string(),
        ));
    }
    Ok(())
}

/// A single-consumer completion value for one operation.
///
/// Await it from async code, or call [`wait`](DbFuture::wait) to park the
/// calling thread until the operation reaches its terminal state. Dropping
/// the future abandons the result; the operation itself still runs to
/// completion on the reactor.
#[derive(Debug)]
pub struct DbFuture<T> {
    rx: oneshot::Receiver<Result<T>>,
    core: Option<Arc<OperationCore>>,
}

impl<T> DbFuture<T> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<T>>) -> Self {
        Self { rx, core: None }
    }

    /// Attaches the operation this future observes, enabling
    /// [`cancel`](DbFuture::cancel).
    pub(crate) fn with_core(mut self, core: Arc<OperationCore>) -> Self {
        self.core = Some(core);
        self
    }

    /// An already-resolved future, for requests refused before any
    /// operation was constructed.
    pub(crate) fn ready(result: Result<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx, core: None }
    }

    /// Requests cancellation of the underlying operation. Idempotent and
    /// callable from any thread; the future then resolves to
    /// [`Error::Cancelled`] unless the operation already completed.
    pub fn cancel(&self) {
        if let Some(core) = &self.core {
            core.cancel();
        }
    }

    /// Block the calling thread until the operation completes.
    ///
    /// Must not be called from the reactor thread or from inside any other
    /// async runtime; such calls fail with a client error instead of
    /// deadlocking.
    pub fn wait(self) -> Result<T> {
        blocking_guard()?;
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| Err(Error::Client("operation abandoned its result".to_string())))
    }
}

impl<T> Future for DbFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Client(
                "operation abandoned its result".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}
