//! # Idempotency Cache
//!
//! Keyed by `(client_id, request id)` (§4.4). A replayed command with the
//! same key must return a byte-identical `Response` and must not mutate
//! storage or re-publish a replication event a second time — so each cache
//! entry also remembers which change events the original execution
//! emitted, purely so callers that introspect "did this produce an event"
//! (tests, anti-entropy bookkeeping) get a consistent answer on replay.
//!
//! Capacity and TTL are implementation choices the source leaves open
//! (§9); 10,000 entries and a 60s TTL are picked here — the TTL matches
//! the longest timeout class (sync/anti-entropy rounds, §4.4), which is
//! the minimum the open question asks for.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::command::types::Response;

pub const DEFAULT_CAPACITY: usize = 10_000;
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub response: Response,
    /// `(node_id, seq)` of any replication events the original execution
    /// emitted; empty for read-only or no-op commands.
    pub emitted_events: Vec<(String, u64)>,
    inserted_at: Instant,
}

pub struct IdempotencyCache {
    entries: LruCache<(String, String), CachedResponse>,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self { entries: LruCache::new(capacity), ttl }
    }

    /// Look up a prior response for `(client_id, id)`. An empty `id`
    /// always misses (§4.4: "empty id bypasses the cache").
    pub fn get(&mut self, client_id: &str, id: &str) -> Option<CachedResponse> {
        if id.is_empty() {
            return None;
        }
        let key = (client_id.to_string(), id.to_string());
        match self.entries.get(&key) {
            Some(cached) if cached.inserted_at.elapsed() <= self.ttl => Some(cached.clone()),
            Some(_) => {
                self.entries.pop(&key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&mut self, client_id: &str, id: &str, response: Response, emitted_events: Vec<(String, u64)>) {
        if id.is_empty() {
            return;
        }
        let key = (client_id.to_string(), id.to_string());
        self.entries.put(key, CachedResponse { response, emitted_events, inserted_at: Instant::now() });
    }
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::types::Response;

    #[test]
    fn empty_id_never_caches() {
        let mut cache = IdempotencyCache::default();
        cache.insert("c1", "", Response::ok(""), vec![]);
        assert!(cache.get("c1", "").is_none());
    }

    #[test]
    fn hit_returns_same_response() {
        let mut cache = IdempotencyCache::default();
        cache.insert("c1", "r1", Response::ok_value("r1", "alice"), vec![("node-a".into(), 5)]);
        let hit = cache.get("c1", "r1").unwrap();
        assert_eq!(hit.response.value.as_deref(), Some("alice"));
        assert_eq!(hit.emitted_events, vec![("node-a".to_string(), 5)]);
    }

    #[test]
    fn distinct_client_ids_do_not_collide() {
        let mut cache = IdempotencyCache::default();
        cache.insert("c1", "r1", Response::ok_value("r1", "a"), vec![]);
        assert!(cache.get("c2", "r1").is_none());
    }

    #[test]
    fn expired_entry_misses() {
        let mut cache = IdempotencyCache::new(DEFAULT_CAPACITY, Duration::from_millis(1));
        cache.insert("c1", "r1", Response::ok("r1"), vec![]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("c1", "r1").is_none());
    }
}
