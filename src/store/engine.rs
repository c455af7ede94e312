//! # Storage Engine Trait
//!
//! Common interface for all storage backends. Unlike the teacher's
//! `KVEngineStoreTrait` (which stored raw `String` values and pushed
//! increment/append semantics down into the engine), this trait is built
//! around [`StorageEntry`] so that LWW resolution and tombstone handling
//! live in exactly one place regardless of backend.

use crate::error::Result;
use crate::model::StorageEntry;

/// Swappable storage backend. All engines must be safe to share across
/// threads and async tasks (`Send + Sync`), since the same engine is used
/// from the command processor, the replication subscriber, and the
/// anti-entropy loop concurrently.
pub trait StorageEngine: Send + Sync {
    /// Look up the current entry for `key`, tombstones included. Callers
    /// that want "does this key have a live value" must check
    /// `!entry.is_tombstone`.
    fn get(&self, key: &str) -> Option<StorageEntry>;

    /// Apply an incoming entry under LWW. Returns `Ok(true)` if the entry
    /// won and is now the visible state for its key, `Ok(false)` if an
    /// existing entry outranked it (including an exact duplicate).
    fn apply(&self, entry: StorageEntry) -> Result<bool>;

    /// Snapshot of every entry currently held, tombstones included. Used to
    /// rebuild the anti-entropy Merkle tree and to answer bulk reads.
    fn all_entries(&self) -> Vec<StorageEntry>;

    /// Number of entries (including tombstones not yet reaped).
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Permanently drop tombstones older than `retention_ms` measured
    /// against `now_ms`. Returns the number reaped.
    fn reap_tombstones(&self, now_ms: u64, retention_ms: u64) -> usize;

    /// Force any buffered writes to durable storage. A no-op for
    /// non-persistent engines.
    fn flush(&self) -> Result<()>;
}
