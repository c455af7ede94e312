//! # In-Memory Storage Engine
//!
//! `RwLock<HashMap>` the way the teacher's `RwLockEngine` did it: multiple
//! concurrent readers, one writer at a time, no unsafe code. The difference
//! is what's behind the lock — a [`StorageEntry`] carrying LWW metadata
//! instead of a raw `String` — and that `set`/`delete` are replaced by a
//! single `apply` that resolves conflicts instead of overwriting blindly.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::Result;
use crate::model::StorageEntry;
use crate::store::engine::StorageEngine;

/// Thread-safe, non-persistent storage engine. All data is lost when the
/// process exits; suitable as the default backend and for tests.
pub struct MemoryEngine {
    data: RwLock<HashMap<String, StorageEntry>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self { data: RwLock::new(HashMap::new()) }
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine for MemoryEngine {
    fn get(&self, key: &str) -> Option<StorageEntry> {
        let data = self.data.read().unwrap();
        data.get(key).cloned()
    }

    fn apply(&self, entry: StorageEntry) -> Result<bool> {
        let mut data = self.data.write().unwrap();
        match data.get(&entry.key) {
            Some(existing) if !existing.is_strictly_won_by(&entry) => Ok(false),
            _ => {
                data.insert(entry.key.clone(), entry);
                Ok(true)
            }
        }
    }

    fn all_entries(&self) -> Vec<StorageEntry> {
        let data = self.data.read().unwrap();
        data.values().cloned().collect()
    }

    fn len(&self) -> usize {
        let data = self.data.read().unwrap();
        data.len()
    }

    fn reap_tombstones(&self, now_ms: u64, retention_ms: u64) -> usize {
        let mut data = self.data.write().unwrap();
        let before = data.len();
        data.retain(|_, entry| {
            !(entry.is_tombstone && now_ms.saturating_sub(entry.timestamp_ms) > retention_ms)
        });
        before - data.len()
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, value: &str, ts: u64, node: &str, seq: u64) -> StorageEntry {
        StorageEntry::new_set(key.into(), value.into(), ts, node.into(), seq)
    }

    #[test]
    fn apply_then_get_roundtrips() {
        let engine = MemoryEngine::new();
        assert!(engine.apply(entry("k", "v1", 10, "a", 1)).unwrap());
        assert_eq!(engine.get("k").unwrap().value.as_deref(), Some("v1"));
    }

    #[test]
    fn apply_rejects_stale_write() {
        let engine = MemoryEngine::new();
        assert!(engine.apply(entry("k", "new", 20, "a", 2)).unwrap());
        assert!(!engine.apply(entry("k", "stale", 10, "a", 1)).unwrap());
        assert_eq!(engine.get("k").unwrap().value.as_deref(), Some("new"));
    }

    #[test]
    fn apply_tie_breaks_on_node_id() {
        let engine = MemoryEngine::new();
        assert!(engine.apply(entry("k", "from-b", 10, "b", 1)).unwrap());
        assert!(engine.apply(entry("k", "from-c", 10, "c", 1)).unwrap());
        assert_eq!(engine.get("k").unwrap().value.as_deref(), Some("from-c"));
        assert!(!engine.apply(entry("k", "from-a", 10, "a", 1)).unwrap());
        assert_eq!(engine.get("k").unwrap().value.as_deref(), Some("from-c"));
    }

    #[test]
    fn tombstone_hides_value_but_stays_until_reaped() {
        let engine = MemoryEngine::new();
        engine.apply(entry("k", "v", 10, "a", 1)).unwrap();
        let tomb = StorageEntry::new_tombstone("k".into(), 20, "a".into(), 2);
        assert!(engine.apply(tomb).unwrap());
        assert!(engine.get("k").unwrap().is_tombstone);
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.reap_tombstones(20 + 1000, 500), 1);
        assert_eq!(engine.len(), 0);
    }

    #[test]
    fn concurrent_readers_see_consistent_state() {
        use std::sync::Arc;
        use std::thread;

        let engine = Arc::new(MemoryEngine::new());
        engine.apply(entry("k", "v", 1, "a", 1)).unwrap();
        let mut handles = vec![];
        for _ in 0..8 {
            let e = engine.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    assert_eq!(e.get("k").unwrap().value.as_deref(), Some("v"));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
