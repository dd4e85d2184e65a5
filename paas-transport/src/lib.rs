pub mod http;
pub mod mock;
pub mod transport;

pub use http::HttpTransport;
pub use mock::MockTransport;
pub use paas_core::TransportError;
pub use transport::{HttpRequest, HttpResponse, Transport};
