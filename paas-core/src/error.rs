use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Credentials are incomplete and no signature can be produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SigningError {
    #[error("missing application id")]
    MissingApplicationId,
    #[error("missing client key")]
    MissingClientKey,
}

/// Network-level failure. This is the only class that may be deferred.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("network is offline")]
    Offline,
    #[error("unexpected HTTP status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Failure of the external key-value store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// Structured rejection returned by the backend, e.g. a validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("application error {code} (HTTP {status}): {message}")]
pub struct ApplicationError {
    pub status: u16,
    pub code: i64,
    pub message: String,
}

impl ApplicationError {
    /// Parses a `{"code": .., "error": ..}` body. Returns `None` when the body
    /// is not a structured rejection.
    pub fn from_body(status: u16, body: &[u8]) -> Option<Self> {
        let value: Value = serde_json::from_slice(body).ok()?;
        let code = value.get("code")?.as_i64()?;
        let message = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        Some(ApplicationError {
            status,
            code,
            message,
        })
    }
}

/// Failure of one item inside an otherwise well-formed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("batch item failed: {message}")]
pub struct ItemError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    pub message: String,
}

impl ItemError {
    /// Reads an item-level `error` field, which the backend sends either as a
    /// plain string or as a `{code, error}` object.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(message) => ItemError {
                code: None,
                message: message.clone(),
            },
            Value::Object(map) => ItemError {
                code: map.get("code").and_then(Value::as_i64),
                message: map
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string()),
            },
            other => ItemError {
                code: None,
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum PaasError {
    #[error("signing failed: {0}")]
    Signing(#[from] SigningError),

    #[error("malformed operation: {0}")]
    MalformedOperation(String),

    #[error("no cached response for {key}")]
    CacheMiss { key: String },

    #[error("batch response has {actual} items, expected {expected}")]
    BatchShapeMismatch { expected: usize, actual: usize },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Application(#[from] ApplicationError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl PaasError {
    pub fn malformed(message: impl Into<String>) -> Self {
        PaasError::MalformedOperation(message.into())
    }

    /// True for network and timeout failures, the class eligible for the
    /// deferred queue and for cache fallback.
    pub fn is_transport(&self) -> bool {
        matches!(self, PaasError::Transport(_))
    }
}

impl From<serde_json::Error> for PaasError {
    fn from(err: serde_json::Error) -> Self {
        PaasError::Codec(err.to_string())
    }
}

pub type PaasResult<T> = Result<T, PaasError>;
