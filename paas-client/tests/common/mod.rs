// Shared fixtures for dispatcher integration tests
#![allow(dead_code)]

use paas_client::{ClientConfig, Credentials, Dispatcher, PaasResult, RetryConfig, Session};
use paas_core::MemoryStore;
use paas_transport::MockTransport;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

pub struct Fixture {
    pub dispatcher: Dispatcher,
    pub transport: Arc<MockTransport>,
    pub store: Arc<MemoryStore>,
    pub session: Arc<Session>,
}

pub fn config() -> ClientConfig {
    ClientConfig::new("http://mock.test").with_retry(RetryConfig::immediate())
}

pub fn fixture() -> Fixture {
    fixture_with(config())
}

pub fn fixture_with(config: ClientConfig) -> Fixture {
    paas_client::logging::init_test_logging();
    let transport = Arc::new(MockTransport::new());
    let store = Arc::new(MemoryStore::new());
    let session = Arc::new(Session::new(Credentials::new("app-id", "client-key")));
    let dispatcher = Dispatcher::builder(config, Arc::clone(&session))
        .transport(transport.clone())
        .store(store.clone())
        .build()
        .unwrap();
    Fixture {
        dispatcher,
        transport,
        store,
        session,
    }
}

/// Callback that forwards every invocation to a channel.
pub fn collector<T: Send + 'static>() -> (
    impl FnMut(PaasResult<T>) + Send + 'static,
    UnboundedReceiver<PaasResult<T>>,
) {
    let (tx, rx) = unbounded_channel();
    let callback = move |result: PaasResult<T>| {
        let _ = tx.send(result);
    };
    (callback, rx)
}

/// Everything the callback received so far.
pub fn drain_results<T>(rx: &mut UnboundedReceiver<PaasResult<T>>) -> Vec<PaasResult<T>> {
    let mut results = Vec::new();
    while let Ok(result) = rx.try_recv() {
        results.push(result);
    }
    results
}
