// Response cache over the external key-value store

use bytes::Bytes;
use paas_core::{CacheEntry, KeyValueStore, PaasResult, StoreError};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace, warn};

const CACHE_PREFIX: &str = "cache/";

/// Cached GET responses keyed by `Operation::cache_key`.
#[derive(Debug, Clone)]
pub struct CacheStore {
    store: Arc<dyn KeyValueStore>,
}

impl CacheStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        CacheStore { store }
    }

    fn record_key(key: &str) -> String {
        format!("{}{}", CACHE_PREFIX, key)
    }

    /// Returns the entry for `key`. A record that fails to decode is removed
    /// and reported as absent.
    pub fn get(&self, key: &str) -> PaasResult<Option<CacheEntry>> {
        let record_key = Self::record_key(key);
        let Some(bytes) = self.store.get(&record_key)? else {
            trace!("Cache miss for {}", key);
            return Ok(None);
        };
        match CacheEntry::from_bytes(&record_key, &bytes) {
            Ok(entry) => {
                trace!("Cache hit for {}", key);
                Ok(Some(entry))
            }
            Err(StoreError::Corrupt { reason, .. }) => {
                warn!("Discarding corrupt cache entry {}: {}", key, reason);
                self.store.delete(&record_key)?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn put(&self, key: &str, payload: Value) -> PaasResult<()> {
        self.put_entry(&CacheEntry::new(key, payload))
    }

    pub fn put_entry(&self, entry: &CacheEntry) -> PaasResult<()> {
        let bytes = entry.to_bytes()?;
        self.store
            .put(&Self::record_key(&entry.key), Bytes::from(bytes))?;
        debug!("Cached response for {}", entry.key);
        Ok(())
    }

    pub fn invalidate(&self, key: &str) -> PaasResult<()> {
        self.store.delete(&Self::record_key(key))?;
        Ok(())
    }

    /// Removes every cache entry and returns how many were removed.
    pub fn clear_all(&self) -> PaasResult<usize> {
        let keys = self.store.keys(CACHE_PREFIX)?;
        for key in &keys {
            self.store.delete(key)?;
        }
        debug!("Cleared {} cache entries", keys.len());
        Ok(keys.len())
    }

    pub fn len(&self) -> PaasResult<usize> {
        Ok(self.store.keys(CACHE_PREFIX)?.len())
    }

    pub fn is_empty(&self) -> PaasResult<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use paas_core::MemoryStore;
    use serde_json::json;

    fn cache() -> (Arc<MemoryStore>, CacheStore) {
        let store = Arc::new(MemoryStore::new());
        let cache = CacheStore::new(store.clone());
        (store, cache)
    }

    #[test]
    fn test_put_get_invalidate() {
        let (_, cache) = cache();
        cache.put("abc", json!({"objectId": "abc"})).unwrap();

        let entry = cache.get("abc").unwrap().unwrap();
        assert_eq!(entry.payload["objectId"], "abc");

        cache.invalidate("abc").unwrap();
        assert!(cache.get("abc").unwrap().is_none());
    }

    #[test]
    fn test_entry_keeps_timestamp_and_etag() {
        let (_, cache) = cache();
        let stored_at = Utc::now() - TimeDelta::seconds(90);
        let entry = CacheEntry::new("k", json!(1))
            .with_stored_at(stored_at)
            .with_etag(Some("\"v1\"".into()));
        cache.put_entry(&entry).unwrap();

        assert_eq!(cache.get("k").unwrap().unwrap(), entry);
    }

    #[test]
    fn test_corrupt_entry_is_discarded() {
        let (store, cache) = cache();
        store
            .put("cache/broken", Bytes::from_static(b"not json"))
            .unwrap();

        assert!(cache.get("broken").unwrap().is_none());
        assert!(store.get("cache/broken").unwrap().is_none());
    }

    #[test]
    fn test_clear_all_leaves_other_namespaces() {
        let (store, cache) = cache();
        cache.put("a", json!(1)).unwrap();
        cache.put("b", json!(2)).unwrap();
        store
            .put("queue/00000000000000000001", Bytes::from_static(b"{}"))
            .unwrap();

        assert_eq!(cache.clear_all().unwrap(), 2);
        assert!(cache.is_empty().unwrap());
        assert_eq!(store.len(), 1);
    }
}
