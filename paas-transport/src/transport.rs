use async_trait::async_trait;
use bytes::Bytes;
use indexmap::IndexMap;
use paas_core::{Method, TransportError};
use serde_json::Value;

/// Fully built outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: IndexMap<String, String>,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        HttpRequest {
            method,
            url: url.into(),
            headers: IndexMap::new(),
            body: None,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json_body(&self) -> Option<Value> {
        self.body
            .as_ref()
            .and_then(|b| serde_json::from_slice(b).ok())
    }
}

/// Raw response as received from the network. Header names are lowercase.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: IndexMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        HttpResponse {
            status,
            headers: IndexMap::new(),
            body: body.into(),
        }
    }

    pub fn json(status: u16, value: &Value) -> Self {
        HttpResponse::new(status, value.to_string())
            .with_header("content-type", "application/json")
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }
}

/// Executes one physical request. Implementations report network failures
/// as `TransportError`; any HTTP status, including errors, is a response.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_header_lookup_is_case_insensitive() {
        let mut request = HttpRequest::new(Method::Get, "http://localhost/1.1/classes/Foo");
        request.headers.insert("X-LC-Id".into(), "app".into());
        assert_eq!(request.header("x-lc-id"), Some("app"));
        assert_eq!(request.header("X-LC-Key"), None);
    }

    #[test]
    fn test_response_helpers() {
        let response = HttpResponse::json(201, &json!({"objectId": "1"})).with_header("ETag", "\"v1\"");
        assert!(response.is_success());
        assert!(!response.is_not_modified());
        assert_eq!(response.header("etag"), Some("\"v1\""));
        assert_eq!(response.header("Content-Type"), Some("application/json"));
    }
}
