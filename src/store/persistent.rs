//! # Persistent Storage Engine
//!
//! Grounded on the teacher's `SledEngine`, but sled is used here as an
//! append-only log rather than a direct key→value table. Every applied
//! [`StorageEntry`] is appended under a monotonically increasing big-endian
//! key (so iteration order is insertion order), and a [`MemoryEngine`]
//! keeps the materialized, LWW-resolved view in memory for fast reads. On
//! open, the log is replayed in order through the same `apply` path used
//! at runtime, which naturally re-derives the correct LWW winner per key.
//!
//! This trades a slightly larger on-disk footprint (every write is kept,
//! not just the latest) for a simple, crash-safe durability story: a
//! partially written last record is just an incomplete sled transaction,
//! and replay from the start is always correct.

use sled::{Db, Tree};

use crate::error::Result;
use crate::model::StorageEntry;
use crate::store::engine::StorageEngine;
use crate::store::memory::MemoryEngine;

pub struct PersistentEngine {
    db: Db,
    log: Tree,
    index: MemoryEngine,
}

impl PersistentEngine {
    /// Open (creating if absent) the sled database at `storage_path` and
    /// replay its log into an in-memory index.
    pub fn open(storage_path: &str) -> Result<Self> {
        let db = sled::open(storage_path)?;
        let log = db.open_tree(b"change_log")?;
        let index = MemoryEngine::new();

        for record in log.iter() {
            let (_seq_key, value) = record?;
            let entry: StorageEntry = serde_cbor::from_slice(&value)?;
            index.apply(entry)?;
        }

        Ok(Self { db, log, index })
    }

    fn next_log_key(&self) -> Result<[u8; 8]> {
        let next = self.log.generate_id()?;
        Ok(next.to_be_bytes())
    }
}

impl StorageEngine for PersistentEngine {
    fn get(&self, key: &str) -> Option<StorageEntry> {
        self.index.get(key)
    }

    fn apply(&self, entry: StorageEntry) -> Result<bool> {
        let applied = self.index.apply(entry.clone())?;
        if applied {
            let log_key = self.next_log_key()?;
            let bytes = serde_cbor::to_vec(&entry)?;
            self.log.insert(log_key, bytes)?;
        }
        Ok(applied)
    }

    fn all_entries(&self) -> Vec<StorageEntry> {
        self.index.all_entries()
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn reap_tombstones(&self, now_ms: u64, retention_ms: u64) -> usize {
        // The log keeps every historical write regardless; only the
        // in-memory index (and therefore what `all_entries`/`get` expose)
        // drops expired tombstones. Compaction of the log itself is left
        // to sled's own background GC.
        self.index.reap_tombstones(now_ms, retention_ms)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(key: &str, value: &str, ts: u64, node: &str, seq: u64) -> StorageEntry {
        StorageEntry::new_set(key.into(), value.into(), ts, node.into(), seq)
    }

    #[test]
    fn apply_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        {
            let engine = PersistentEngine::open(path).unwrap();
            engine.apply(entry("k", "v1", 10, "a", 1)).unwrap();
            engine.flush().unwrap();
        }
        let reopened = PersistentEngine::open(path).unwrap();
        assert_eq!(reopened.get("k").unwrap().value.as_deref(), Some("v1"));
    }

    #[test]
    fn replay_resolves_lww_from_log_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        {
            let engine = PersistentEngine::open(path).unwrap();
            engine.apply(entry("k", "first", 10, "a", 1)).unwrap();
            engine.apply(entry("k", "second", 20, "a", 2)).unwrap();
            engine.apply(entry("k", "stale", 5, "a", 3)).unwrap();
        }
        let reopened = PersistentEngine::open(path).unwrap();
        assert_eq!(reopened.get("k").unwrap().value.as_deref(), Some("second"));
    }
}
