// FileStore behavior against a real directory

use bytes::Bytes;
use paas_core::{CacheEntry, FileStore, KeyValueStore, StoreError};
use serde_json::json;

#[test]
fn test_put_get_delete() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).unwrap();

    store.put("cache/abc", Bytes::from_static(b"payload")).unwrap();
    assert_eq!(
        store.get("cache/abc").unwrap(),
        Some(Bytes::from_static(b"payload"))
    );

    store.put("cache/abc", Bytes::from_static(b"replaced")).unwrap();
    assert_eq!(
        store.get("cache/abc").unwrap(),
        Some(Bytes::from_static(b"replaced"))
    );

    store.delete("cache/abc").unwrap();
    assert_eq!(store.get("cache/abc").unwrap(), None);
    store.delete("cache/abc").unwrap();
}

#[test]
fn test_keys_are_sorted_and_filtered() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).unwrap();

    store.put("queue/00000000000000000002", Bytes::from_static(b"b")).unwrap();
    store.put("queue/00000000000000000001", Bytes::from_static(b"a")).unwrap();
    store.put("cache/zzz", Bytes::from_static(b"c")).unwrap();

    assert_eq!(
        store.keys("queue/").unwrap(),
        vec!["queue/00000000000000000001", "queue/00000000000000000002"]
    );
    assert_eq!(store.keys("").unwrap().len(), 3);
    assert!(store.keys("missing/").unwrap().is_empty());
}

#[test]
fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let entry = CacheEntry::new("cache/k", json!({"objectId": "abc"}));
    {
        let store = FileStore::open(dir.path()).unwrap();
        store
            .put("cache/k", Bytes::from(entry.to_bytes().unwrap()))
            .unwrap();
    }

    let reopened = FileStore::open(dir.path()).unwrap();
    let bytes = reopened.get("cache/k").unwrap().unwrap();
    let loaded = CacheEntry::from_bytes("cache/k", &bytes).unwrap();
    assert_eq!(loaded, entry);
}

#[test]
fn test_rejects_escaping_keys() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).unwrap();
    let err = store.put("../outside", Bytes::new()).unwrap_err();
    assert!(matches!(err, StoreError::InvalidKey(_)));
}
