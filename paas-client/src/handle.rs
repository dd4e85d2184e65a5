// Request handles
// Every dispatcher call runs as a task; the handle cancels it or waits on it.

use paas_core::{PaasError, PaasResult, TransportError};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Callback<T> = Box<dyn FnMut(PaasResult<T>) + Send>;

/// Delivers results to a caller's callback. Shared between the work future
/// and the cancellation path of its task.
pub(crate) struct Responder<T> {
    callback: Arc<Mutex<Callback<T>>>,
    emitted: Arc<AtomicUsize>,
}

impl<T> Clone for Responder<T> {
    fn clone(&self) -> Self {
        Responder {
            callback: Arc::clone(&self.callback),
            emitted: Arc::clone(&self.emitted),
        }
    }
}

impl<T> Responder<T> {
    pub(crate) fn new<F>(callback: F) -> Self
    where
        F: FnMut(PaasResult<T>) + Send + 'static,
    {
        Responder {
            callback: Arc::new(Mutex::new(Box::new(callback))),
            emitted: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn emit(&self, result: PaasResult<T>) {
        let mut callback = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
        self.emitted.fetch_add(1, Ordering::SeqCst);
        (*callback)(result);
    }

    pub(crate) fn emitted(&self) -> usize {
        self.emitted.load(Ordering::SeqCst)
    }
}

/// Handle to an in-flight dispatcher call.
#[derive(Debug)]
pub struct RequestHandle {
    task: JoinHandle<()>,
    token: CancellationToken,
    runtime: Handle,
}

impl RequestHandle {
    pub(crate) fn spawn<T, W, Fut>(runtime: &Handle, responder: Responder<T>, work: W) -> Self
    where
        T: Send + 'static,
        W: FnOnce(Responder<T>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let work = work(responder.clone());
        let task = runtime.spawn(async move {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => {
                    debug!("Request cancelled after {} callback(s)", responder.emitted());
                    responder.emit(Err(PaasError::Cancelled));
                }
                _ = work => {}
            }
        });
        RequestHandle {
            task,
            token,
            runtime: runtime.clone(),
        }
    }

    /// Requests cancellation. The callback receives `PaasError::Cancelled`
    /// unless the call already completed.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the call to complete and its callback(s) to return.
    pub async fn join(self) -> PaasResult<()> {
        self.task.await.map_err(join_error)
    }

    /// Blocks the current thread until the call completes. Must not be called
    /// from inside an async runtime; use `join` there.
    pub fn wait(self) -> PaasResult<()> {
        ensure_blocking_allowed()?;
        let runtime = self.runtime.clone();
        runtime.block_on(self.join())
    }

    /// Like `wait`, but cancels the call when `timeout` elapses first.
    pub fn wait_timeout(self, timeout: Duration) -> PaasResult<()> {
        ensure_blocking_allowed()?;
        let RequestHandle {
            mut task,
            token,
            runtime,
        } = self;
        runtime.block_on(async move {
            match tokio::time::timeout(timeout, &mut task).await {
                Ok(joined) => joined.map_err(join_error),
                Err(_) => {
                    debug!("Request exceeded {:?}, cancelling", timeout);
                    token.cancel();
                    task.await.map_err(join_error)?;
                    Err(TransportError::Timeout(timeout).into())
                }
            }
        })
    }
}

fn ensure_blocking_allowed() -> PaasResult<()> {
    if Handle::try_current().is_ok() {
        return Err(PaasError::Internal(
            "blocking wait called from within an async runtime; use join().await".to_string(),
        ));
    }
    Ok(())
}

fn join_error(err: JoinError) -> PaasError {
    if err.is_cancelled() {
        PaasError::Cancelled
    } else {
        PaasError::Internal(format!("request task failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    fn responder() -> (Responder<Value>, mpsc::UnboundedReceiver<PaasResult<Value>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let responder = Responder::new(move |result| {
            let _ = tx.send(result);
        });
        (responder, rx)
    }

    #[tokio::test]
    async fn test_completed_call_reports_once() {
        let (responder, mut rx) = responder();
        let handle = RequestHandle::spawn(&Handle::current(), responder, |r| async move {
            r.emit(Ok(json!(1)));
        });
        handle.join().await.unwrap();

        assert_eq!(rx.recv().await.unwrap().unwrap(), json!(1));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_reports_cancelled() {
        let (responder, mut rx) = responder();
        let handle = RequestHandle::spawn(&Handle::current(), responder, |r| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            r.emit(Ok(json!("late")));
        });
        handle.cancel();
        assert!(handle.is_cancelled());
        handle.join().await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), Err(PaasError::Cancelled)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wait_inside_runtime_is_rejected() {
        let (responder, _rx) = responder();
        let handle = RequestHandle::spawn(&Handle::current(), responder, |_| async {});
        assert!(matches!(handle.wait(), Err(PaasError::Internal(_))));
    }

    #[test]
    fn test_wait_blocks_until_done() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (responder, mut rx) = responder();
        let handle = RequestHandle::spawn(runtime.handle(), responder, |r| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            r.emit(Ok(json!("done")));
        });
        handle.wait().unwrap();
        assert_eq!(rx.try_recv().unwrap().unwrap(), json!("done"));
    }

    #[test]
    fn test_wait_timeout_cancels() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (responder, mut rx) = responder();
        let handle = RequestHandle::spawn(runtime.handle(), responder, |r| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            r.emit(Ok(json!("late")));
        });
        let err = handle.wait_timeout(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(
            err,
            PaasError::Transport(TransportError::Timeout(_))
        ));
        assert!(matches!(rx.try_recv().unwrap(), Err(PaasError::Cancelled)));
    }

    #[test]
    fn test_panicking_callback_is_internal() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let responder: Responder<Value> = Responder::new(|_| panic!("callback bug"));
        let handle = RequestHandle::spawn(runtime.handle(), responder, |r| async move {
            r.emit(Ok(Value::Null));
        });
        assert!(matches!(handle.wait(), Err(PaasError::Internal(_))));
    }
}
