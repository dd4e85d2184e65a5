// paas-rs client
// Request dispatch for a backend-as-a-service SDK:
// - Signed requests with session-aware credentials
// - Per-call cache policies with ETag revalidation
// - Batch and batch-save calls with index-aligned results
// - A persistent queue for eventual operations issued while offline
// - Subclass materialization of fetched objects

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod handle;
pub mod logging;
pub mod queue;
pub mod registry;
pub mod request;
pub mod session;

pub use cache::CacheStore;
pub use config::{ClientConfig, RetryConfig};
pub use dispatcher::{BatchReply, Dispatcher, DispatcherBuilder, Reply};
pub use handle::RequestHandle;
pub use queue::{DeferredQueue, DrainReport};
pub use registry::{GenericObject, ObjectFactory, PaasObject, SubclassRegistry};
pub use request::{AuthHeaders, RequestBuilder};
pub use session::{CurrentUser, Session};

pub use paas_core::{
    BatchRequest, CachePolicy, Credentials, ItemError, ItemResult, Method, Operation, PaasError,
    PaasResult, QueuedId,
};
pub use paas_transport::{HttpTransport, MockTransport, Transport};
