//! Applies inbound replication frames under LWW (§3, §4.3): decode, drop
//! self-originated and duplicate events, reject events too far in the
//! future, then hand the rest to the storage engine.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use crate::anti_entropy::PeerRegistry;
use crate::metrics::{inc, Metrics};
use crate::model::ChangeEvent;
use crate::store::StorageEngine;

/// Bound on the self-originated/duplicate dedup window. Generous relative
/// to any plausible in-flight replication burst on a mobile link.
const DEDUP_WINDOW: usize = 4096;

pub struct ReplicationSubscriber {
    store: Arc<dyn StorageEngine>,
    node_id: String,
    skew_max_future_ms: u64,
    metrics: Arc<Metrics>,
    peers: Arc<PeerRegistry>,
    seen_order: Mutex<VecDeque<(String, u64)>>,
    seen_set: Mutex<HashSet<(String, u64)>>,
}

impl ReplicationSubscriber {
    pub fn new(store: Arc<dyn StorageEngine>, node_id: impl Into<String>, skew_max_future_ms: u64, metrics: Arc<Metrics>, peers: Arc<PeerRegistry>) -> Self {
        Self {
            store,
            node_id: node_id.into(),
            skew_max_future_ms,
            metrics,
            peers,
            seen_order: Mutex::new(VecDeque::with_capacity(DEDUP_WINDOW)),
            seen_set: Mutex::new(HashSet::with_capacity(DEDUP_WINDOW)),
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
    }

    /// `true` if this is the first time the dedup key has been seen in the
    /// current window; marks it seen regardless.
    fn mark_seen(&self, key: (String, u64)) -> bool {
        let mut set = self.seen_set.lock().unwrap();
        if !set.insert(key.clone()) {
            return false;
        }
        let mut order = self.seen_order.lock().unwrap();
        order.push_back(key);
        if order.len() > DEDUP_WINDOW {
            if let Some(oldest) = order.pop_front() {
                set.remove(&oldest);
            }
        }
        true
    }

    /// Decode and apply one raw replication frame.
    pub fn apply_frame(&self, bytes: &[u8]) {
        let event = match ChangeEvent::from_canonical_cbor(bytes) {
            Ok(e) => e,
            Err(e) => {
                warn!("failed to decode replication frame: {e}");
                inc!(self.metrics.replication_decode_errors);
                return;
            }
        };
        self.apply_event(event);
    }

    fn apply_event(&self, event: ChangeEvent) {
        if event.node_id == self.node_id {
            inc!(self.metrics.replication_dropped_self);
            return;
        }
        self.peers.observe(&event.node_id, &self.node_id);
        if !self.mark_seen(event.dedup_key()) {
            inc!(self.metrics.replication_dropped_duplicate);
            return;
        }
        let now = Self::now_ms();
        if event.timestamp_ms > now + self.skew_max_future_ms {
            warn!("dropping replication event for {} with future timestamp {}", event.key, event.timestamp_ms);
            inc!(self.metrics.replication_dropped_skew);
            return;
        }

        let entry = event.to_storage_entry();
        if let Err(e) = entry.validate_sizes() {
            warn!("dropping oversize replication event for {}: {e}", event.key);
            return;
        }
        match self.store.apply(entry) {
            Ok(true) => {
                inc!(self.metrics.replication_applied);
                debug!("applied replication event for {}", event.key);
            }
            Ok(false) => {
                debug!("replication event for {} outranked by existing entry", event.key);
            }
            Err(e) => warn!("failed to apply replication event for {}: {e}", event.key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StorageEntry;
    use crate::store::MemoryEngine;

    fn subscriber(node_id: &str) -> ReplicationSubscriber {
        ReplicationSubscriber::new(Arc::new(MemoryEngine::new()), node_id, 300_000, Arc::new(Metrics::default()), Arc::new(PeerRegistry::new(Vec::new())))
    }

    #[test]
    fn drops_self_originated_events() {
        let sub = subscriber("node-a");
        let entry = StorageEntry::new_set("k".into(), "v".into(), 1000, "node-a".into(), 1);
        sub.apply_event(entry.to_change_event());
        assert_eq!(sub.metrics.replication_dropped_self.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert!(sub.store.get("k").is_none());
    }

    #[test]
    fn remote_events_populate_the_peer_registry() {
        let sub = subscriber("node-a");
        let entry = StorageEntry::new_set("k".into(), "v".into(), 1000, "node-b".into(), 1);
        sub.apply_event(entry.to_change_event());
        assert_eq!(sub.peers.snapshot(), vec!["node-b".to_string()]);
    }

    #[test]
    fn applies_remote_event_under_lww() {
        let sub = subscriber("node-a");
        let entry = StorageEntry::new_set("k".into(), "v".into(), 1000, "node-b".into(), 1);
        sub.apply_event(entry.to_change_event());
        let stored = sub.store.get("k").unwrap();
        assert_eq!(stored.value.as_deref(), Some("v"));
    }

    #[test]
    fn drops_duplicate_events() {
        let sub = subscriber("node-a");
        let entry = StorageEntry::new_set("k".into(), "v".into(), 1000, "node-b".into(), 1);
        sub.apply_event(entry.to_change_event());
        sub.apply_event(entry.to_change_event());
        assert_eq!(sub.metrics.replication_dropped_duplicate.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn drops_future_skewed_events() {
        let sub = subscriber("node-a");
        let far_future = ReplicationSubscriber::now_ms() + 10_000_000;
        let entry = StorageEntry::new_set("k".into(), "v".into(), far_future, "node-b".into(), 1);
        sub.apply_event(entry.to_change_event());
        assert_eq!(sub.metrics.replication_dropped_skew.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert!(sub.store.get("k").is_none());
    }
}
