// Batch composition
// N operations become one {"requests": [...]} body; the response array is
// index-aligned with the request array. A length mismatch fails the whole
// batch, while per-item failures stay with their item.

use crate::error::{ItemError, PaasError, PaasResult};
use crate::model::{Method, Operation};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, trace};

pub type ItemResult = Result<Value, ItemError>;

/// One entry of a physical batch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    #[serde(skip)]
    pub index: usize,
    pub method: Method,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
}

#[derive(Debug, Clone)]
pub struct BatchComposer {
    api_version: String,
}

impl BatchComposer {
    pub fn new(api_version: impl Into<String>) -> Self {
        BatchComposer {
            api_version: api_version.into().trim_matches('/').to_string(),
        }
    }

    /// Converts operations into batch items, keeping input order as the
    /// authoritative index.
    pub fn items(&self, operations: &[Operation]) -> PaasResult<Vec<BatchItem>> {
        operations
            .iter()
            .enumerate()
            .map(|(index, op)| {
                op.validate()?;
                let path = format!("/{}{}", self.api_version, op.path());
                let (body, params) = if op.method().uses_query() {
                    let params = (!op.parameters().is_empty()).then(|| op.parameters().clone());
                    (None, params)
                } else {
                    (Some(Value::Object(op.parameters().clone())), None)
                };
                Ok(BatchItem {
                    index,
                    method: op.method(),
                    path,
                    body,
                    params,
                })
            })
            .collect()
    }

    pub fn compose(&self, operations: &[Operation]) -> PaasResult<Value> {
        let items = self.items(operations)?;
        debug!("Composed batch of {} items", items.len());
        Ok(json!({ "requests": items }))
    }

    /// Splits a physical batch response into per-item results. Returns
    /// exactly `original_count` results or fails with `BatchShapeMismatch`.
    pub fn decompose(response: &Value, original_count: usize) -> PaasResult<Vec<ItemResult>> {
        let entries = response.as_array().ok_or(PaasError::BatchShapeMismatch {
            expected: original_count,
            actual: 0,
        })?;

        if entries.len() != original_count {
            return Err(PaasError::BatchShapeMismatch {
                expected: original_count,
                actual: entries.len(),
            });
        }

        let results = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                if let Some(success) = entry.get("success") {
                    Ok(success.clone())
                } else if let Some(error) = entry.get("error") {
                    trace!("Batch item {} failed: {}", index, error);
                    Err(ItemError::from_value(error))
                } else {
                    Err(ItemError {
                        code: None,
                        message: format!("batch item {} has neither success nor error", index),
                    })
                }
            })
            .collect();

        Ok(results)
    }
}

impl Default for BatchComposer {
    fn default() -> Self {
        BatchComposer::new(crate::DEFAULT_API_VERSION)
    }
}
