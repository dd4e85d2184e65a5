use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Identity of a request parked in the deferred queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueuedId(Uuid);

impl QueuedId {
    pub fn new() -> Self {
        QueuedId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for QueuedId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueuedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueuedId({})", self.0)
    }
}

impl From<Uuid> for QueuedId {
    fn from(value: Uuid) -> Self {
        QueuedId(value)
    }
}

/// Monotonic sequence numbers, used to give queue records keys that sort in
/// enqueue order.
#[derive(Debug)]
pub struct SequenceAllocator {
    next: AtomicU64,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        SequenceAllocator {
            next: AtomicU64::new(first),
        }
    }

    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    pub fn peek_next(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_queued_id_serializes_as_uuid() {
        let id = QueuedId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
        let back: QueuedId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_allocator_monotonic() {
        let allocator = SequenceAllocator::starting_at(7);
        assert_eq!(allocator.allocate(), 7);
        assert_eq!(allocator.allocate(), 8);
        assert_eq!(allocator.peek_next(), 9);
    }

    #[test]
    fn test_allocator_thread_safety() {
        let allocator = Arc::new(SequenceAllocator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = Arc::clone(&allocator);
                thread::spawn(move || (0..50).map(|_| alloc.allocate()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "Duplicate sequence number: {}", id);
            }
        }
        assert_eq!(seen.len(), 400);
        assert_eq!(allocator.peek_next(), 401);
    }
}
