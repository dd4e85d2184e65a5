// In-memory transport for tests and offline simulation

use crate::transport::{HttpRequest, HttpResponse, Transport};
use async_trait::async_trait;
use paas_core::TransportError;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub type MockHandler =
    Arc<dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync>;

/// Answers requests from a script of queued responses, falling back to a
/// handler closure. Can be switched offline to simulate lost connectivity.
pub struct MockTransport {
    online: AtomicBool,
    attempts: AtomicUsize,
    scripted: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    handler: Mutex<Option<MockHandler>>,
    requests: Mutex<Vec<HttpRequest>>,
    delay: Mutex<Option<Duration>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            attempts: AtomicUsize::new(0),
            scripted: Mutex::new(VecDeque::new()),
            handler: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
        }
    }

    /// Queues a response; scripted responses are consumed in order before the
    /// handler is consulted.
    pub fn push_response(&self, response: HttpResponse) {
        lock(&self.scripted).push_back(Ok(response));
    }

    pub fn push_error(&self, error: TransportError) {
        lock(&self.scripted).push_back(Err(error));
    }

    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        *lock(&self.handler) = Some(Arc::new(handler));
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Delays every response, so callers can exercise timeouts and
    /// cancellation.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.delay) = delay;
    }

    /// Requests that reached the (online) server, in arrival order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Every call to `execute`, including ones rejected while offline.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("online", &self.is_online())
            .field("attempts", &self.attempts())
            .field("scripted", &lock(&self.scripted).len())
            .finish()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if !self.is_online() {
            return Err(TransportError::Offline);
        }

        lock(&self.requests).push(request.clone());

        if let Some(scripted) = lock(&self.scripted).pop_front() {
            return scripted;
        }

        let handler = lock(&self.handler).clone();
        match handler {
            Some(handler) => handler(&request),
            None => Err(TransportError::Connection(format!(
                "no mock response for {} {}",
                request.method, request.url
            ))),
        }
    }
}
