// Logical request model
// Operations are what callers hand to the dispatcher; they are immutable once
// built and serializable so the deferred queue can persist them.

use crate::error::{PaasError, PaasResult};
use chrono::TimeDelta;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }

    /// GET and DELETE carry parameters in the query string, PUT and POST in
    /// the body.
    pub fn uses_query(&self) -> bool {
        matches!(self, Method::Get | Method::Delete)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = PaasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "PUT" => Ok(Method::Put),
            "POST" => Ok(Method::Post),
            "DELETE" => Ok(Method::Delete),
            other => Err(PaasError::malformed(format!("unsupported method {}", other))),
        }
    }
}

/// Rule deciding whether a cached response may answer a GET.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    #[default]
    NetworkOnly,
    CacheOnly,
    NetworkElseCache,
    CacheElseNetwork,
    /// Answers twice: once from the cache (when present), then from the
    /// network.
    CacheThenNetwork,
    CacheOrNetwork,
}

impl CachePolicy {
    pub fn reads_cache(&self) -> bool {
        !matches!(self, CachePolicy::NetworkOnly)
    }

    pub fn writes_cache(&self) -> bool {
        !matches!(self, CachePolicy::NetworkOnly | CachePolicy::CacheOnly)
    }
}

#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub application_id: String,
    pub client_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(default)]
    pub production_mode: bool,
}

impl Credentials {
    pub fn new(application_id: impl Into<String>, client_key: impl Into<String>) -> Self {
        Credentials {
            application_id: application_id.into(),
            client_key: client_key.into(),
            session_token: None,
            production_mode: true,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn with_production_mode(mut self, production: bool) -> Self {
        self.production_mode = production;
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("application_id", &self.application_id)
            .field("client_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("production_mode", &self.production_mode)
            .finish()
    }
}

/// One logical unit of work: a get/put/post/delete on a resource path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    method: Method,
    path: String,
    #[serde(default)]
    parameters: Map<String, Value>,
    #[serde(default)]
    headers: IndexMap<String, String>,
    #[serde(default)]
    cache_policy: CachePolicy,
    #[serde(default = "TimeDelta::zero", with = "max_age_millis")]
    max_cache_age: TimeDelta,
    #[serde(default)]
    is_eventual: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_token: Option<String>,
}

impl Operation {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Operation {
            method,
            path: path.into(),
            parameters: Map::new(),
            headers: IndexMap::new(),
            cache_policy: CachePolicy::default(),
            max_cache_age: TimeDelta::zero(),
            is_eventual: false,
            session_token: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    pub fn with_max_cache_age(mut self, max_age: TimeDelta) -> Self {
        self.max_cache_age = max_age;
        self
    }

    /// Marks the operation as eventual: a transport failure parks it in the
    /// deferred queue instead of failing the caller.
    pub fn eventually(mut self) -> Self {
        self.is_eventual = true;
        self
    }

    pub fn with_eventual(mut self, eventual: bool) -> Self {
        self.is_eventual = eventual;
        self
    }

    /// Authenticates this call alone with `token`, in place of the client
    /// key or the session's own token.
    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parameters(&self) -> &Map<String, Value> {
        &self.parameters
    }

    pub fn headers(&self) -> &IndexMap<String, String> {
        &self.headers
    }

    pub fn cache_policy(&self) -> CachePolicy {
        self.cache_policy
    }

    pub fn max_cache_age(&self) -> TimeDelta {
        self.max_cache_age
    }

    pub fn is_eventual(&self) -> bool {
        self.is_eventual
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    pub fn validate(&self) -> PaasResult<()> {
        if self.path.trim().is_empty() {
            return Err(PaasError::malformed("path is empty"));
        }
        if !self.path.starts_with('/') {
            return Err(PaasError::malformed(format!(
                "path {} must start with '/'",
                self.path
            )));
        }
        Ok(())
    }

    /// Deterministic cache identity derived from method, path and parameters.
    /// Parameter order does not affect the key.
    pub fn cache_key(&self) -> String {
        let mut canonical = String::new();
        canonical.push_str(self.method.as_str());
        canonical.push(' ');
        canonical.push_str(&self.path);
        canonical.push(' ');
        write_canonical(&Value::Object(self.parameters.clone()), &mut canonical);

        let digest = Sha256::digest(canonical.as_bytes());
        hex(&digest)
    }
}

/// Several operations sent as one physical request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BatchRequest {
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    #[serde(default)]
    pub is_eventual: bool,
}

impl BatchRequest {
    pub fn new(operations: Vec<Operation>) -> Self {
        BatchRequest {
            operations,
            headers: IndexMap::new(),
            is_eventual: false,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn eventually(mut self) -> Self {
        self.is_eventual = true;
        self
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{:02x}", b);
        out
    })
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

mod max_age_millis {
    use chrono::TimeDelta;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &TimeDelta, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_milliseconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TimeDelta, D::Error> {
        let millis = i64::deserialize(deserializer)?;
        TimeDelta::try_milliseconds(millis)
            .ok_or_else(|| D::Error::custom(format!("max cache age {}ms out of range", millis)))
    }
}
