// paas-rs core
// Data model, error taxonomy, request signing, batch codec and the
// key-value persistence boundary shared by the transport and client crates.

pub mod batch;
pub mod error;
pub mod ids;
pub mod model;
pub mod record;
pub mod signer;
pub mod store;

pub use batch::{BatchComposer, BatchItem, ItemResult};
pub use error::{
    ApplicationError, ItemError, PaasError, PaasResult, SigningError, StoreError, TransportError,
};
pub use ids::{QueuedId, SequenceAllocator};
pub use model::{BatchRequest, CachePolicy, Credentials, Method, Operation};
pub use record::{CacheEntry, QueuedPayload, QueuedRequest};
pub use signer::{FixedNonce, NonceSource, RandomNonce, Sha256Signature, SignatureAlgorithm, Signer};
pub use store::{FileStore, KeyValueStore, MemoryStore};

/// Header carrying the application id.
pub const HEADER_APP_ID: &str = "X-LC-Id";
/// Header carrying the client key when no session token is present.
pub const HEADER_APP_KEY: &str = "X-LC-Key";
/// Header carrying the request signature.
pub const HEADER_SIGN: &str = "X-LC-Sign";
/// Header carrying the session token of the logged-in user.
pub const HEADER_SESSION: &str = "X-LC-Session";
/// Header marking production (`1`) or staging (`0`) traffic.
pub const HEADER_PRODUCTION: &str = "X-LC-Prod";

/// Default REST API version prefix.
pub const DEFAULT_API_VERSION: &str = "1.1";
