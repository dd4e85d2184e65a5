// Request dispatcher
// Entry point for every call: resolves cache policy, signs and sends the
// request, interprets the response and parks eventual work that could not
// reach the server.

use crate::cache::CacheStore;
use crate::config::ClientConfig;
use crate::handle::{RequestHandle, Responder};
use crate::queue::{DeferredQueue, DrainReport};
use crate::registry::PaasObject;
use crate::request::RequestBuilder;
use crate::session::{CurrentUser, Session};
use chrono::Utc;
use paas_core::{
    ApplicationError, BatchComposer, BatchRequest, CacheEntry, CachePolicy, ItemResult,
    KeyValueStore, MemoryStore, Method, Operation, PaasError, PaasResult, QueuedId,
    QueuedPayload, Signer, TransportError,
};
use paas_transport::{HttpRequest, HttpResponse, HttpTransport, Transport};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, info, trace, warn};

/// Result of a single call.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Answered from the local cache
    Cached(Value),
    /// Answered by the server
    Network(Value),
    /// Could not reach the server; parked in the deferred queue
    Queued(QueuedId),
}

impl Reply {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Reply::Cached(value) | Reply::Network(value) => Some(value),
            Reply::Queued(_) => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Reply::Cached(value) | Reply::Network(value) => Some(value),
            Reply::Queued(_) => None,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Reply::Cached(_))
    }

    pub fn queued_id(&self) -> Option<QueuedId> {
        match self {
            Reply::Queued(id) => Some(*id),
            _ => None,
        }
    }
}

/// Result of a batch call. Items are index-aligned with the request.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchReply {
    Items(Vec<ItemResult>),
    Queued(QueuedId),
}

#[derive(Debug)]
struct Inner {
    config: ClientConfig,
    session: Arc<Session>,
    transport: Arc<dyn Transport>,
    builder: RequestBuilder,
    composer: BatchComposer,
    cache: CacheStore,
    queue: DeferredQueue,
    permits: Semaphore,
    runtime: Handle,
}

/// Dispatches operations to the backend. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

pub struct DispatcherBuilder {
    config: ClientConfig,
    session: Arc<Session>,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn KeyValueStore>>,
    cache_store: Option<Arc<dyn KeyValueStore>>,
    queue_store: Option<Arc<dyn KeyValueStore>>,
    signer: Option<Signer>,
    runtime: Option<Handle>,
}

impl DispatcherBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Store backing both the cache and the deferred queue.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn cache_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    pub fn queue_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.queue_store = Some(store);
        self
    }

    pub fn signer(mut self, signer: Signer) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Runtime the calls are spawned on. Defaults to the current one.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> PaasResult<Dispatcher> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| {
                PaasError::Internal(
                    "no tokio runtime available; pass one with DispatcherBuilder::runtime"
                        .to_string(),
                )
            })?,
        };

        let config = self.config;
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(config.timeout)?),
        };

        let shared = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>);
        let cache_store = self.cache_store.unwrap_or_else(|| Arc::clone(&shared));
        let queue_store = self.queue_store.unwrap_or(shared);

        let builder = RequestBuilder::new(
            config.server_url.clone(),
            config.api_version.clone(),
            config.user_agent.clone(),
            self.signer.unwrap_or_default(),
        )
        .with_auth_headers(config.auth_headers.clone());
        let composer = BatchComposer::new(config.api_version.clone());
        let queue = DeferredQueue::open(queue_store, config.retry.clone())?;
        let permits = Semaphore::new(config.max_concurrent_requests.max(1));

        let dispatcher = Dispatcher {
            inner: Arc::new(Inner {
                session: self.session,
                transport,
                builder,
                composer,
                cache: CacheStore::new(cache_store),
                queue,
                permits,
                runtime,
                config,
            }),
        };

        info!(
            "Dispatcher ready for {} (API {})",
            dispatcher.inner.config.server_url, dispatcher.inner.config.api_version
        );

        if dispatcher.inner.config.drain_on_startup {
            dispatcher.start_drain(log_drain_result);
        }
        Ok(dispatcher)
    }
}

impl Dispatcher {
    pub fn builder(config: ClientConfig, session: Arc<Session>) -> DispatcherBuilder {
        DispatcherBuilder {
            config,
            session,
            transport: None,
            store: None,
            cache_store: None,
            queue_store: None,
            signer: None,
            runtime: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn queue(&self) -> &DeferredQueue {
        &self.inner.queue
    }

    pub fn get<F>(&self, operation: Operation, callback: F) -> RequestHandle
    where
        F: FnMut(PaasResult<Reply>) + Send + 'static,
    {
        self.single(Method::Get, operation, callback)
    }

    pub fn put<F>(&self, operation: Operation, callback: F) -> RequestHandle
    where
        F: FnMut(PaasResult<Reply>) + Send + 'static,
    {
        self.single(Method::Put, operation, callback)
    }

    pub fn post<F>(&self, operation: Operation, callback: F) -> RequestHandle
    where
        F: FnMut(PaasResult<Reply>) + Send + 'static,
    {
        self.single(Method::Post, operation, callback)
    }

    pub fn delete<F>(&self, operation: Operation, callback: F) -> RequestHandle
    where
        F: FnMut(PaasResult<Reply>) + Send + 'static,
    {
        self.single(Method::Delete, operation, callback)
    }

    fn single<F>(&self, expected: Method, operation: Operation, callback: F) -> RequestHandle
    where
        F: FnMut(PaasResult<Reply>) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        RequestHandle::spawn(
            &self.inner.runtime,
            Responder::new(callback),
            move |responder| async move {
                if operation.method() != expected {
                    responder.emit(Err(PaasError::malformed(format!(
                        "{} operation passed to {}",
                        operation.method(),
                        expected
                    ))));
                    return;
                }
                inner.run_single(operation, &responder).await;
            },
        )
    }

    /// Sends all operations as one physical request. The callback fires once
    /// with results aligned to the input order.
    pub fn post_batch<F>(&self, request: BatchRequest, callback: F) -> RequestHandle
    where
        F: FnMut(PaasResult<BatchReply>) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        RequestHandle::spawn(
            &self.inner.runtime,
            Responder::new(callback),
            move |responder| async move {
                if request.is_empty() {
                    responder.emit(Ok(BatchReply::Items(Vec::new())));
                    return;
                }
                let outcome = inner.execute_batch(&request).await;
                let result = match outcome {
                    Ok(items) => Ok(BatchReply::Items(items)),
                    Err(err) => {
                        let eventual = request.is_eventual;
                        inner
                            .defer_or_fail(QueuedPayload::Batch { request, save: false }, eventual, err)
                            .map(BatchReply::Queued)
                    }
                };
                responder.emit(result);
            },
        )
    }

    /// Posts the operations to the batch-save endpoint, which applies them
    /// as one unit and answers with a single value.
    pub fn post_batch_save<F>(&self, request: BatchRequest, callback: F) -> RequestHandle
    where
        F: FnMut(PaasResult<Reply>) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        RequestHandle::spawn(
            &self.inner.runtime,
            Responder::new(callback),
            move |responder| async move {
                if request.is_empty() {
                    responder.emit(Err(PaasError::malformed("batch save has no operations")));
                    return;
                }
                let outcome = inner.execute_batch_save(&request).await;
                let result = match outcome {
                    Ok(value) => Ok(Reply::Network(value)),
                    Err(err) => {
                        let eventual = request.is_eventual;
                        inner
                            .defer_or_fail(QueuedPayload::Batch { request, save: true }, eventual, err)
                            .map(Reply::Queued)
                    }
                };
                responder.emit(result);
            },
        )
    }

    /// GETs an object and materializes it through the session's subclass
    /// registry. Fetches are never deferred.
    pub fn fetch_object<F>(&self, operation: Operation, mut callback: F) -> RequestHandle
    where
        F: FnMut(PaasResult<Box<dyn PaasObject>>) + Send + 'static,
    {
        let session = Arc::clone(&self.inner.session);
        let adapter = move |result: PaasResult<Reply>| {
            let object = result.and_then(|reply| match reply {
                Reply::Cached(value) | Reply::Network(value) => Ok(session.materialize(&value)),
                Reply::Queued(id) => Err(PaasError::Internal(format!(
                    "fetch unexpectedly deferred as {}",
                    id
                ))),
            });
            callback(object);
        };
        self.single(Method::Get, operation.with_eventual(false), adapter)
    }

    /// Replays the deferred queue on the caller's task.
    pub async fn drain_queue(&self) -> PaasResult<DrainReport> {
        drain(&self.inner).await
    }

    /// Replays the deferred queue on the dispatcher's runtime.
    pub fn start_drain<F>(&self, callback: F) -> RequestHandle
    where
        F: FnMut(PaasResult<DrainReport>) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        RequestHandle::spawn(
            &self.inner.runtime,
            Responder::new(callback),
            move |responder| async move {
                responder.emit(drain(&inner).await);
            },
        )
    }

    /// Signals that connectivity returned. Starts a drain when
    /// `drain_on_reconnect` is enabled.
    pub fn notify_reconnected(&self) -> Option<RequestHandle> {
        if !self.inner.config.drain_on_reconnect {
            debug!("Reconnected; automatic drain is disabled");
            return None;
        }
        info!("Reconnected; draining deferred queue");
        Some(self.start_drain(log_drain_result))
    }

    /// Removes every cached response, including stored ETags.
    pub fn clear_last_modify_cache(&self) -> PaasResult<usize> {
        self.inner.cache.clear_all()
    }

    /// Logs the current user out and drops cached responses, which may be
    /// user-scoped.
    pub fn log_out(&self) -> PaasResult<Option<CurrentUser>> {
        let previous = self.inner.session.log_out();
        self.inner.cache.clear_all()?;
        Ok(previous)
    }

    pub fn absolute_url(
        &self,
        path: &str,
        parameters: Option<&Map<String, Value>>,
    ) -> PaasResult<String> {
        self.inner.builder.absolute_url(path, parameters)
    }
}

async fn drain(inner: &Arc<Inner>) -> PaasResult<DrainReport> {
    inner
        .queue
        .drain(|payload| {
            let inner = Arc::clone(inner);
            async move { inner.replay(payload).await }
        })
        .await
}

fn log_drain_result(result: PaasResult<DrainReport>) {
    match result {
        Ok(report) => debug!(
            "Automatic drain: {} replayed, {} remaining",
            report.replayed.len(),
            report.remaining
        ),
        Err(e) => warn!("Automatic drain failed: {}", e),
    }
}

impl Inner {
    async fn run_single(&self, operation: Operation, responder: &Responder<Reply>) {
        if let Err(e) = operation.validate() {
            responder.emit(Err(e));
            return;
        }

        if operation.method() != Method::Get {
            responder.emit(self.network_or_defer(operation).await);
            return;
        }

        let key = operation.cache_key();
        let result = match operation.cache_policy() {
            CachePolicy::NetworkOnly => self.network_or_defer(operation).await,
            CachePolicy::CacheOnly => match self.read_cache(&key) {
                Some(entry) => Ok(Reply::Cached(entry.payload)),
                None => Err(PaasError::CacheMiss { key }),
            },
            CachePolicy::CacheElseNetwork => match self.read_cache(&key) {
                Some(entry) => Ok(Reply::Cached(entry.payload)),
                None => self.network_or_defer(operation).await,
            },
            CachePolicy::CacheOrNetwork => {
                let max_age = operation.max_cache_age();
                match self
                    .read_cache(&key)
                    .filter(|entry| entry.is_fresh(max_age, Utc::now()))
                {
                    Some(entry) => Ok(Reply::Cached(entry.payload)),
                    None => self.network_or_defer(operation).await,
                }
            }
            CachePolicy::NetworkElseCache => {
                let outcome = self.execute_single(&operation).await;
                match outcome {
                    Ok(value) => Ok(Reply::Network(value)),
                    Err(err) if err.is_transport() => match self.read_cache(&key) {
                        Some(entry) => {
                            debug!("Network failed ({}), answering {} from cache", err, key);
                            Ok(Reply::Cached(entry.payload))
                        }
                        None => {
                            let eventual = operation.is_eventual();
                            self.defer_or_fail(QueuedPayload::Single { operation }, eventual, err)
                                .map(Reply::Queued)
                        }
                    },
                    Err(err) => Err(err),
                }
            }
            CachePolicy::CacheThenNetwork => {
                if let Some(entry) = self.read_cache(&key) {
                    responder.emit(Ok(Reply::Cached(entry.payload)));
                }
                self.network_or_defer(operation).await
            }
        };
        responder.emit(result);
    }

    async fn network_or_defer(&self, operation: Operation) -> PaasResult<Reply> {
        let outcome = self.execute_single(&operation).await;
        match outcome {
            Ok(value) => Ok(Reply::Network(value)),
            Err(err) => {
                let eventual = operation.is_eventual();
                self.defer_or_fail(QueuedPayload::Single { operation }, eventual, err)
                    .map(Reply::Queued)
            }
        }
    }

    /// Parks `payload` when it is eventual and `err` is a transport failure;
    /// otherwise surfaces `err`.
    fn defer_or_fail(
        &self,
        payload: QueuedPayload,
        eventual: bool,
        err: PaasError,
    ) -> PaasResult<QueuedId> {
        if eventual && err.is_transport() {
            debug!("Deferring {} after {}", payload.describe(), err);
            self.queue.enqueue(payload)
        } else {
            Err(err)
        }
    }

    fn read_cache(&self, key: &str) -> Option<CacheEntry> {
        match self.cache.get(key) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Cache read failed for {}: {}", key, e);
                None
            }
        }
    }

    fn write_cache(&self, entry: &CacheEntry) {
        if let Err(e) = self.cache.put_entry(entry) {
            warn!("Cache write failed for {}: {}", entry.key, e);
        }
    }

    /// Shared by live calls and queue replays.
    async fn execute_single(&self, operation: &Operation) -> PaasResult<Value> {
        let credentials = self.session.credentials();
        let mut request = self.builder.build(operation, &credentials)?;

        let policy = operation.cache_policy();
        let caches = operation.method() == Method::Get && policy != CachePolicy::NetworkOnly;
        let key = caches.then(|| operation.cache_key());

        let cached = match &key {
            Some(key) if self.config.last_modify_enabled => self.read_cache(key),
            _ => None,
        };
        if let Some(etag) = cached.as_ref().and_then(|entry| entry.etag.as_deref()) {
            trace!("Revalidating with If-None-Match {}", etag);
            request
                .headers
                .insert("If-None-Match".to_string(), etag.to_string());
        }

        let response = self.send(request).await?;

        if response.is_not_modified() {
            return match cached {
                Some(entry) => {
                    debug!("{} not modified, using cached payload", operation.path());
                    let refreshed = entry.with_stored_at(Utc::now());
                    self.write_cache(&refreshed);
                    Ok(refreshed.payload)
                }
                None => Err(TransportError::Status {
                    status: response.status,
                    body: "not modified without a cached entry".to_string(),
                }
                .into()),
            };
        }

        let value = interpret(&response)?;
        if let Some(key) = key.filter(|_| policy.writes_cache()) {
            let etag = if self.config.last_modify_enabled {
                response.header("etag").map(str::to_string)
            } else {
                None
            };
            self.write_cache(&CacheEntry::new(key, value.clone()).with_etag(etag));
        }
        Ok(value)
    }

    async fn execute_batch(&self, request: &BatchRequest) -> PaasResult<Vec<ItemResult>> {
        let body = self.composer.compose(&request.operations)?;
        let value = self
            .post_json(&self.config.batch_path, body, request)
            .await?;
        BatchComposer::decompose(&value, request.len())
    }

    async fn execute_batch_save(&self, request: &BatchRequest) -> PaasResult<Value> {
        let body = self.composer.compose(&request.operations)?;
        self.post_json(&self.config.batch_save_path, body, request)
            .await
    }

    async fn post_json(&self, path: &str, body: Value, request: &BatchRequest) -> PaasResult<Value> {
        let Value::Object(parameters) = body else {
            return Err(PaasError::Internal("batch body is not an object".to_string()));
        };
        let credentials = self.session.credentials();
        let http = self.builder.build_raw(
            Method::Post,
            path,
            &parameters,
            &request.headers,
            &credentials,
        )?;
        let response = self.send(http).await?;
        interpret(&response)
    }

    async fn replay(&self, payload: QueuedPayload) -> PaasResult<Value> {
        match payload {
            QueuedPayload::Single { operation } => self.execute_single(&operation).await,
            QueuedPayload::Batch {
                request,
                save: false,
            } => {
                let items = self.execute_batch(&request).await?;
                Ok(items_to_value(items))
            }
            QueuedPayload::Batch {
                request,
                save: true,
            } => self.execute_batch_save(&request).await,
        }
    }

    /// Executes one physical request under a worker permit and the per-call
    /// timeout.
    async fn send(&self, request: HttpRequest) -> PaasResult<HttpResponse> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| PaasError::Internal("dispatcher is shut down".to_string()))?;

        debug!("{} {}", request.method, request.url);
        let timeout = self.config.timeout;
        match tokio::time::timeout(timeout, self.transport.execute(request)).await {
            Ok(result) => {
                let response = result?;
                trace!("Response status {}", response.status);
                Ok(response)
            }
            Err(_) => {
                debug!("Request timed out after {:?}", timeout);
                Err(TransportError::Timeout(timeout).into())
            }
        }
    }
}

/// Maps a response to the call's result. Structured `{code, error}` bodies
/// and unstructured 4xx answers are application errors; unstructured 5xx
/// answers count as transport failures.
fn interpret(response: &HttpResponse) -> PaasResult<Value> {
    if response.is_success() {
        if response.body.is_empty() {
            return Ok(Value::Null);
        }
        return Ok(serde_json::from_slice(&response.body)?);
    }

    if let Some(err) = ApplicationError::from_body(response.status, &response.body) {
        return Err(err.into());
    }

    let body = String::from_utf8_lossy(&response.body).into_owned();
    if response.status >= 500 {
        Err(TransportError::Status {
            status: response.status,
            body,
        }
        .into())
    } else {
        Err(ApplicationError {
            status: response.status,
            code: i64::from(response.status),
            message: body,
        }
        .into())
    }
}

fn items_to_value(items: Vec<ItemResult>) -> Value {
    Value::Array(
        items
            .into_iter()
            .map(|item| match item {
                Ok(value) => json!({ "success": value }),
                Err(err) => json!({ "error": { "code": err.code, "error": err.message } }),
            })
            .collect(),
    )
}
