use std::collections::HashSet;
use std::sync::Mutex;

pub const DEFAULT_DEDUP_CAPACITY: usize = 5000;

/// At-most-once-per-process admission filter keyed by the platform message id.
/// Bounded: when the set reaches capacity it is cleared wholesale rather than
/// evicted entry by entry. Crash-losable by design, it is not a durable
/// idempotency mechanism.
pub struct DedupGuard {
    capacity: usize,
    seen: Mutex<HashSet<String>>,
}

impl DedupGuard {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Messages without an id are never deduplicated.
    pub fn seen(&self, id: Option<&str>) -> bool {
        let Some(id) = id else {
            return false;
        };
        self.seen.lock().expect("dedup lock poisoned").contains(id)
    }

    pub fn mark_seen(&self, id: &str) {
        let mut seen = self.seen.lock().expect("dedup lock poisoned");
        if seen.len() >= self.capacity {
            seen.clear();
        }
        seen.insert(id.to_string());
    }

    /// Check and mark under one lock acquisition, so the same id arriving
    /// twice concurrently cannot both be admitted. Returns true when the
    /// message should be processed.
    pub fn check_and_mark(&self, id: Option<&str>) -> bool {
        let Some(id) = id else {
            return true;
        };
        let mut seen = self.seen.lock().expect("dedup lock poisoned");
        if seen.contains(id) {
            return false;
        }
        if seen.len() >= self.capacity {
            seen.clear();
        }
        seen.insert(id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.seen.lock().expect("dedup lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DedupGuard {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}
