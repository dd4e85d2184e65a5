// Persisted records
// Both cache entries and queued requests are stored as JSON in the external
// key-value store and are always replaced whole.

use crate::error::{PaasResult, StoreError};
use crate::ids::QueuedId;
use crate::model::{BatchRequest, Operation};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Value,
    pub stored_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, payload: Value) -> Self {
        CacheEntry {
            key: key.into(),
            payload,
            stored_at: Utc::now(),
            etag: None,
        }
    }

    pub fn with_stored_at(mut self, stored_at: DateTime<Utc>) -> Self {
        self.stored_at = stored_at;
        self
    }

    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.stored_at
    }

    /// An entry is fresh while its age does not exceed `max_age`. A zero or
    /// negative `max_age` never accepts an entry.
    pub fn is_fresh(&self, max_age: TimeDelta, now: DateTime<Utc>) -> bool {
        max_age > TimeDelta::zero() && self.age(now) <= max_age
    }

    pub fn to_bytes(&self) -> PaasResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(key: &str, bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueuedPayload {
    Single { operation: Operation },
    Batch { request: BatchRequest, save: bool },
}

impl QueuedPayload {
    pub fn describe(&self) -> String {
        match self {
            QueuedPayload::Single { operation } => {
                format!("{} {}", operation.method(), operation.path())
            }
            QueuedPayload::Batch { request, save } => {
                let kind = if *save { "batch save" } else { "batch" };
                format!("{} of {} operations", kind, request.len())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub id: QueuedId,
    pub payload: QueuedPayload,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl QueuedRequest {
    pub fn new(payload: QueuedPayload) -> Self {
        QueuedRequest {
            id: QueuedId::new(),
            payload,
            enqueued_at: Utc::now(),
            retry_count: 0,
            next_attempt_at: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    pub fn to_bytes(&self) -> PaasResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(key: &str, bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}
