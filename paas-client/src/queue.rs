// Deferred request queue
// Eventual operations that could not reach the server are persisted here and
// replayed in enqueue order once connectivity returns.

use crate::config::RetryConfig;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use paas_core::{
    KeyValueStore, PaasError, PaasResult, QueuedId, QueuedPayload, QueuedRequest,
    SequenceAllocator, StoreError,
};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const QUEUE_PREFIX: &str = "queue/";

/// Outcome of one drain pass.
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Replayed successfully, with the server's answer
    pub replayed: Vec<(QueuedId, Value)>,
    /// Rejected by the server and removed
    pub rejected: Vec<(QueuedId, PaasError)>,
    /// Removed after exhausting an explicit `RetryConfig::max_attempts`
    pub dropped: Vec<QueuedId>,
    /// The item that stopped the drain, if any
    pub deferred: Option<QueuedId>,
    /// Unreadable records that were removed
    pub discarded: usize,
    pub remaining: usize,
}

impl DrainReport {
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

/// Persisted FIFO of deferred requests. Several queues may write to one
/// store without clobbering each other, but drains are only serialized
/// within a single queue.
#[derive(Debug)]
pub struct DeferredQueue {
    store: Arc<dyn KeyValueStore>,
    sequence: SequenceAllocator,
    drain_lock: Mutex<()>,
    retry: RetryConfig,
}

impl DeferredQueue {
    /// Opens the queue persisted in `store`, continuing its sequence.
    pub fn open(store: Arc<dyn KeyValueStore>, retry: RetryConfig) -> PaasResult<Self> {
        let next = store
            .keys(QUEUE_PREFIX)?
            .iter()
            .filter_map(|key| sequence_of(key))
            .max()
            .map_or(1, |last| last + 1);
        debug!("Opened deferred queue, next sequence {}", next);
        Ok(DeferredQueue {
            store,
            sequence: SequenceAllocator::starting_at(next),
            drain_lock: Mutex::new(()),
            retry,
        })
    }

    /// `queue/{sequence}-{id}`. The zero-padded sequence gives replay order;
    /// the id keeps keys distinct when two queues share a store.
    fn record_key(sequence: u64, id: &QueuedId) -> String {
        format!("{}{:020}-{}", QUEUE_PREFIX, sequence, id.as_uuid().simple())
    }

    pub fn enqueue(&self, payload: QueuedPayload) -> PaasResult<QueuedId> {
        let record = QueuedRequest::new(payload);
        let key = Self::record_key(self.sequence.allocate(), &record.id);
        self.store.put(&key, Bytes::from(record.to_bytes()?))?;
        info!("Deferred {} as {}", record.payload.describe(), record.id);
        Ok(record.id)
    }

    /// Readable queued requests in replay order.
    pub fn pending(&self) -> PaasResult<Vec<QueuedRequest>> {
        let mut pending = Vec::new();
        for key in self.store.keys(QUEUE_PREFIX)? {
            let Some(bytes) = self.store.get(&key)? else {
                continue;
            };
            match QueuedRequest::from_bytes(&key, &bytes) {
                Ok(record) => pending.push(record),
                Err(e) => warn!("Skipping unreadable queue record: {}", e),
            }
        }
        Ok(pending)
    }

    pub fn len(&self) -> PaasResult<usize> {
        Ok(self.store.keys(QUEUE_PREFIX)?.len())
    }

    pub fn is_empty(&self) -> PaasResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn clear(&self) -> PaasResult<usize> {
        let keys = self.store.keys(QUEUE_PREFIX)?;
        for key in &keys {
            self.store.delete(key)?;
        }
        Ok(keys.len())
    }

    /// Replays queued requests through `dispatch` in enqueue order. Stops at
    /// the first request that is not yet due or fails on the transport again.
    pub async fn drain<F, Fut>(&self, mut dispatch: F) -> PaasResult<DrainReport>
    where
        F: FnMut(QueuedPayload) -> Fut,
        Fut: Future<Output = PaasResult<Value>>,
    {
        let _guard = self.drain_lock.lock().await;
        let mut report = DrainReport::default();

        for key in self.store.keys(QUEUE_PREFIX)? {
            let Some(bytes) = self.store.get(&key)? else {
                continue;
            };
            let mut record = match QueuedRequest::from_bytes(&key, &bytes) {
                Ok(record) => record,
                Err(StoreError::Corrupt { reason, .. }) => {
                    warn!("Discarding corrupt queue record {}: {}", key, reason);
                    self.store.delete(&key)?;
                    report.discarded += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if !record.is_due(Utc::now()) {
                debug!("{} is not due yet", record.id);
                report.deferred = Some(record.id);
                break;
            }

            match dispatch(record.payload.clone()).await {
                Ok(value) => {
                    self.store.delete(&key)?;
                    debug!("Replayed {}", record.id);
                    report.replayed.push((record.id, value));
                }
                Err(PaasError::Cancelled) => {
                    report.deferred = Some(record.id);
                    break;
                }
                Err(err) if err.is_transport() => {
                    record.retry_count += 1;
                    if self.retry.is_exhausted(record.retry_count) {
                        warn!(
                            "Dropping {} ({}) after {} attempts: {}",
                            record.id,
                            record.payload.describe(),
                            record.retry_count,
                            err
                        );
                        self.store.delete(&key)?;
                        report.dropped.push(record.id);
                    } else {
                        let delay = self.retry.delay_for_attempt(record.retry_count);
                        let delay = TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
                        record.next_attempt_at = Some(
                            Utc::now()
                                .checked_add_signed(delay)
                                .unwrap_or(DateTime::<Utc>::MAX_UTC),
                        );
                        self.store.put(&key, Bytes::from(record.to_bytes()?))?;
                        debug!(
                            "Replay of {} failed (attempt {}): {}",
                            record.id, record.retry_count, err
                        );
                        report.deferred = Some(record.id);
                    }
                    break;
                }
                Err(err) => {
                    warn!("Server rejected deferred {}: {}", record.id, err);
                    self.store.delete(&key)?;
                    report.rejected.push((record.id, err));
                }
            }
        }

        report.remaining = self.len()?;
        info!(
            "Drain finished: {} replayed, {} rejected, {} dropped, {} remaining",
            report.replayed.len(),
            report.rejected.len(),
            report.dropped.len(),
            report.remaining
        );
        Ok(report)
    }
}

fn sequence_of(key: &str) -> Option<u64> {
    let rest = key.strip_prefix(QUEUE_PREFIX)?;
    let digits = rest.split_once('-').map_or(rest, |(sequence, _)| sequence);
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use paas_core::{ApplicationError, MemoryStore, Operation, TransportError};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn single(path: &str) -> QueuedPayload {
        QueuedPayload::Single {
            operation: Operation::post(path).eventually(),
        }
    }

    fn path_of(payload: &QueuedPayload) -> String {
        match payload {
            QueuedPayload::Single { operation } => operation.path().to_string(),
            QueuedPayload::Batch { .. } => "batch".to_string(),
        }
    }

    fn queue(store: Arc<MemoryStore>) -> DeferredQueue {
        DeferredQueue::open(store, RetryConfig::immediate()).unwrap()
    }

    #[tokio::test]
    async fn test_drain_preserves_enqueue_order() {
        let queue = queue(Arc::new(MemoryStore::new()));
        for i in 0..12 {
            queue.enqueue(single(&format!("/classes/T{}", i))).unwrap();
        }

        let seen = StdMutex::new(Vec::new());
        let report = queue
            .drain(|payload| {
                seen.lock().unwrap().push(path_of(&payload));
                async { Ok(json!({"ok": true})) }
            })
            .await
            .unwrap();

        let expected: Vec<String> = (0..12).map(|i| format!("/classes/T{}", i)).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
        assert_eq!(report.replayed.len(), 12);
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn test_transport_failure_stops_drain() {
        let queue = queue(Arc::new(MemoryStore::new()));
        let first = queue.enqueue(single("/classes/A")).unwrap();
        queue.enqueue(single("/classes/B")).unwrap();

        let calls = StdMutex::new(0);
        let report = queue
            .drain(|_| {
                *calls.lock().unwrap() += 1;
                async { Err(PaasError::Transport(TransportError::Offline)) }
            })
            .await
            .unwrap();

        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(report.deferred, Some(first));
        assert_eq!(report.remaining, 2);
        assert_eq!(queue.pending().unwrap()[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_application_rejection_is_removed() {
        let queue = queue(Arc::new(MemoryStore::new()));
        queue.enqueue(single("/classes/A")).unwrap();
        queue.enqueue(single("/classes/B")).unwrap();

        let report = queue
            .drain(|payload| async move {
                if path_of(&payload) == "/classes/A" {
                    Err(PaasError::Application(ApplicationError {
                        status: 400,
                        code: 142,
                        message: "invalid".into(),
                    }))
                } else {
                    Ok(json!({"objectId": "b"}))
                }
            })
            .await
            .unwrap();

        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.replayed.len(), 1);
        assert!(queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_failed_replays_never_drop_by_default() {
        let queue = queue(Arc::new(MemoryStore::new()));
        let id = queue.enqueue(single("/classes/A")).unwrap();

        for _ in 0..25 {
            let report = queue
                .drain(|_| async { Err(PaasError::Transport(TransportError::Offline)) })
                .await
                .unwrap();
            assert!(report.dropped.is_empty());
            assert_eq!(report.deferred, Some(id));
        }

        let pending = queue.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].retry_count, 25);
    }

    #[tokio::test]
    async fn test_retries_exhausted_drop_item() {
        let retry = RetryConfig::immediate().with_max_attempts(3);
        let queue = DeferredQueue::open(Arc::new(MemoryStore::new()), retry).unwrap();
        let id = queue.enqueue(single("/classes/A")).unwrap();

        let mut last = DrainReport::default();
        for _ in 0..3 {
            last = queue
                .drain(|_| async { Err(PaasError::Transport(TransportError::Offline)) })
                .await
                .unwrap();
        }

        assert_eq!(last.dropped, vec![id]);
        assert!(queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_backoff_defers_next_attempt() {
        let store = Arc::new(MemoryStore::new());
        let retry = RetryConfig::new().with_initial_delay(std::time::Duration::from_secs(3600));
        let queue = DeferredQueue::open(store, retry).unwrap();
        let id = queue.enqueue(single("/classes/A")).unwrap();

        queue
            .drain(|_| async { Err(PaasError::Transport(TransportError::Offline)) })
            .await
            .unwrap();

        let calls = StdMutex::new(0);
        let report = queue
            .drain(|_| {
                *calls.lock().unwrap() += 1;
                async { Ok(Value::Null) }
            })
            .await
            .unwrap();
        assert_eq!(*calls.lock().unwrap(), 0);
        assert_eq!(report.deferred, Some(id));
    }

    #[tokio::test]
    async fn test_negative_backoff_multiplier_keeps_draining() {
        let retry = RetryConfig::new()
            .with_initial_delay(std::time::Duration::from_millis(10))
            .with_backoff_multiplier(-2.0);
        let queue = DeferredQueue::open(Arc::new(MemoryStore::new()), retry).unwrap();
        let id = queue.enqueue(single("/classes/A")).unwrap();

        queue
            .drain(|_| async { Err(PaasError::Transport(TransportError::Offline)) })
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let report = queue
            .drain(|_| async { Err(PaasError::Transport(TransportError::Offline)) })
            .await
            .unwrap();

        assert_eq!(report.deferred, Some(id));
        let pending = queue.pending().unwrap();
        assert_eq!(pending[0].retry_count, 2);
        assert!(pending[0].is_due(Utc::now()));
    }

    #[tokio::test]
    async fn test_reopen_continues_sequence() {
        let store = Arc::new(MemoryStore::new());
        queue(store.clone()).enqueue(single("/classes/A")).unwrap();
        let reopened = queue(store);
        reopened.enqueue(single("/classes/B")).unwrap();

        let paths: Vec<String> = reopened
            .pending()
            .unwrap()
            .iter()
            .map(|r| path_of(&r.payload))
            .collect();
        assert_eq!(paths, vec!["/classes/A", "/classes/B"]);
    }

    #[tokio::test]
    async fn test_queues_sharing_a_store_keep_both_records() {
        let store = Arc::new(MemoryStore::new());
        let first = queue(store.clone());
        let second = queue(store.clone());
        let a = first.enqueue(single("/classes/A")).unwrap();
        let b = second.enqueue(single("/classes/B")).unwrap();

        let ids: Vec<QueuedId> = first.pending().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a));
        assert!(ids.contains(&b));
    }

    #[test]
    fn test_sequence_parsing_accepts_both_key_forms() {
        let id = QueuedId::new();
        assert_eq!(sequence_of(&DeferredQueue::record_key(42, &id)), Some(42));
        assert_eq!(sequence_of("queue/00000000000000000007"), Some(7));
        assert_eq!(sequence_of("cache/00000000000000000007"), None);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_discarded() {
        let store = Arc::new(MemoryStore::new());
        store
            .put("queue/00000000000000000001", Bytes::from_static(b"garbage"))
            .unwrap();
        let queue = queue(store);
        queue.enqueue(single("/classes/A")).unwrap();

        let report = queue.drain(|_| async { Ok(Value::Null) }).await.unwrap();
        assert_eq!(report.discarded, 1);
        assert_eq!(report.replayed.len(), 1);
    }
}
