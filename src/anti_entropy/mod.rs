//! # Anti-Entropy
//!
//! Periodic pull-based reconciliation (§4.6) layered on top of the
//! always-on replication bus: replication alone can lose events (a device
//! offline at publish time, a dropped QoS 1 ack before the broker resends),
//! so anti-entropy periodically compares a Merkle digest of local storage
//! against one configured peer at a time and pulls whatever differs.
//!
//! Generalizes the teacher's `store::merkle::MerkleTree` (see
//! [`merkle`]) into a round-trip protocol (see [`protocol`]) carried over
//! the existing command topics, orchestrated by [`AntiEntropyManager`].

pub mod merkle;
pub mod protocol;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio::sync::oneshot;

use crate::battery::BatteryAdapter;
use crate::command::processor::TimeoutClass;
use crate::config::Config;
use crate::metrics::{inc, Metrics};
use crate::mqtt::MqttSession;
use crate::scheduler::{with_deadline, CancellationHandle};
use crate::store::StorageEngine;

use merkle::MerkleDigestTree;
use protocol::AeMessage;

/// The set of known anti-entropy peer `node_id`s (§4.6: "round-robin among
/// observed `node_id`s"): the statically configured seed list, plus
/// whatever remote `node_id`s this device has seen on the replication bus
/// or on an inbound anti-entropy message. Shared between
/// [`crate::replication::ReplicationSubscriber`] (which feeds it) and
/// [`AntiEntropyManager`] (which drains it), the same way `ConnectionState`
/// is shared via `watch` in `mqtt/session.rs` — here a plain mutexed set
/// suffices since membership, not ordering, is what matters.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    static_peers: Vec<String>,
    discovered: Mutex<HashSet<String>>,
}

impl PeerRegistry {
    pub fn new(static_peers: Vec<String>) -> Self {
        Self { static_peers, discovered: Mutex::new(HashSet::new()) }
    }

    /// Record a peer `node_id` observed on inbound replication or
    /// anti-entropy traffic. A no-op for `self_node_id` so a device never
    /// schedules a round against itself.
    pub fn observe(&self, node_id: &str, self_node_id: &str) {
        if node_id == self_node_id || node_id.is_empty() {
            return;
        }
        self.discovered.lock().unwrap().insert(node_id.to_string());
    }

    /// A stable-ordered, deduplicated view over the static seed list and
    /// every peer observed so far.
    pub fn snapshot(&self) -> Vec<String> {
        let mut peers = self.static_peers.clone();
        for node_id in self.discovered.lock().unwrap().iter() {
            if !peers.contains(node_id) {
                peers.push(node_id.clone());
            }
        }
        peers
    }
}

struct RoundGuard<'a> {
    pending: &'a Mutex<HashMap<u64, oneshot::Sender<AeMessage>>>,
    round_id: u64,
}

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().unwrap().remove(&self.round_id);
    }
}

pub struct AntiEntropyManager {
    store: Arc<dyn StorageEngine>,
    session: Arc<MqttSession>,
    config: Config,
    metrics: Arc<Metrics>,
    battery: Arc<BatteryAdapter>,
    next_round: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<AeMessage>>>,
    peer_cursor: AtomicUsize,
    peers: Arc<PeerRegistry>,
}

impl AntiEntropyManager {
    pub fn new(
        store: Arc<dyn StorageEngine>,
        session: Arc<MqttSession>,
        config: Config,
        metrics: Arc<Metrics>,
        battery: Arc<BatteryAdapter>,
        peers: Arc<PeerRegistry>,
    ) -> Self {
        Self {
            store,
            session,
            config,
            metrics,
            battery,
            next_round: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            peer_cursor: AtomicUsize::new(0),
            peers,
        }
    }

    fn next_peer(&self) -> Option<String> {
        let candidates = self.peers.snapshot();
        if candidates.is_empty() {
            return None;
        }
        let idx = self.peer_cursor.fetch_add(1, Ordering::SeqCst) % candidates.len();
        Some(candidates[idx].clone())
    }

    /// Background loop: run until `cancel` fires. Pauses entirely when the
    /// battery adapter reports critical-and-not-charging (§5).
    pub async fn run(&self, cancel: CancellationHandle) {
        loop {
            let interval = self.battery.effective_anti_entropy_interval(self.config.anti_entropy_interval());
            let sleep_for = match interval {
                Some(d) => d,
                None => {
                    debug!("anti-entropy paused: battery critical and not charging");
                    std::time::Duration::from_secs(30)
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = cancel.cancelled() => return,
            }
            if interval.is_none() {
                continue;
            }
            if let Some(peer) = self.next_peer() {
                if let Err(e) = self.run_round(&peer).await {
                    warn!("anti-entropy round with {peer} failed: {e}");
                    inc!(self.metrics.anti_entropy_rounds_abandoned);
                } else {
                    inc!(self.metrics.anti_entropy_rounds_completed);
                }
            }
        }
    }

    fn register_round(&self) -> (u64, oneshot::Receiver<AeMessage>) {
        let round_id = self.next_round.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(round_id, tx);
        (round_id, rx)
    }

    /// Drops the `pending` entry for `round_id` on scope exit, whether the
    /// round resolved normally (in which case `handle_inbound` already
    /// removed it, and this is a harmless no-op), failed, or timed out.
    /// Without this, every abandoned round (§7: "abandoned and retried
    /// next interval") would leak its `oneshot::Sender` in `pending`
    /// forever, since only the success path ever removed it.
    fn round_guard(&self, round_id: u64) -> RoundGuard<'_> {
        RoundGuard { pending: &self.pending, round_id }
    }

    async fn run_round(&self, peer_client_id: &str) -> crate::error::Result<()> {
        let my_tree = MerkleDigestTree::build(&self.store.all_entries())?;

        let (round_id, rx) = self.register_round();
        let _guard = self.round_guard(round_id);
        let request = AeMessage::DigestRequest { round_id, from_client_id: self.config.client_id.clone() };
        self.send_to(peer_client_id, &request).await?;

        let reply = with_deadline(rx, TimeoutClass::Sync.duration())
            .await
            .map_err(|_| crate::error::MkvError::timeout("anti-entropy digest round timed out"))?
            .map_err(|_| crate::error::MkvError::transport("anti-entropy round sender dropped"))?;

        let peer_leaves = match reply {
            AeMessage::DigestResponse { leaves, .. } => leaves,
            _ => return Err(crate::error::MkvError::transport("unexpected reply to digest request")),
        };

        let diffs = my_tree.differing_buckets(&peer_leaves);
        if diffs.is_empty() {
            return Ok(());
        }

        let (round_id, rx) = self.register_round();
        let _guard = self.round_guard(round_id);
        let request = AeMessage::EntryRequest { round_id, from_client_id: self.config.client_id.clone(), buckets: diffs };
        self.send_to(peer_client_id, &request).await?;

        let reply = with_deadline(rx, TimeoutClass::Sync.duration())
            .await
            .map_err(|_| crate::error::MkvError::timeout("anti-entropy entry round timed out"))?
            .map_err(|_| crate::error::MkvError::transport("anti-entropy round sender dropped"))?;

        let entries = match reply {
            AeMessage::EntryResponse { entries, .. } => entries,
            _ => return Err(crate::error::MkvError::transport("unexpected reply to entry request")),
        };

        let mut pulled = 0u64;
        for event in entries {
            let entry = event.to_storage_entry();
            if entry.validate_sizes().is_err() {
                continue;
            }
            if let Ok(true) = self.store.apply(entry) {
                pulled += 1;
            }
        }
        self.metrics.anti_entropy_entries_pulled.fetch_add(pulled, Ordering::Relaxed);
        info!("anti-entropy round with {peer_client_id} pulled {pulled} entries across {} buckets", peer_leaves.len());
        Ok(())
    }

    async fn send_to(&self, peer_client_id: &str, msg: &AeMessage) -> crate::error::Result<()> {
        let topic = self.config.peer_command_topic(peer_client_id);
        let bytes = msg.to_json().map_err(|e| crate::error::MkvError::codec(e.to_string()))?;
        self.session.publish_to_topic(&topic, bytes).await
    }

    /// Handle an inbound frame on our own command topic that failed to
    /// parse as a [`crate::command::types::Command`]. Returns `true` if it
    /// was recognized as an anti-entropy message (handled either way, by
    /// resolving a pending round or by answering a peer's request).
    pub async fn handle_inbound(&self, payload: &[u8]) -> bool {
        let msg = match AeMessage::from_json(payload) {
            Ok(m) => m,
            Err(_) => return false,
        };

        match &msg {
            AeMessage::DigestRequest { from_client_id, round_id } => {
                self.peers.observe(from_client_id, &self.config.node_id);
                let tree = match MerkleDigestTree::build(&self.store.all_entries()) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("failed to build digest tree for anti-entropy reply: {e}");
                        return true;
                    }
                };
                let response = AeMessage::DigestResponse {
                    round_id: *round_id,
                    from_client_id: self.config.client_id.clone(),
                    root: tree.root(),
                    leaves: tree.leaves().to_vec(),
                };
                if let Err(e) = self.send_to(from_client_id, &response).await {
                    warn!("failed to send digest response to {from_client_id}: {e}");
                }
            }
            AeMessage::EntryRequest { from_client_id, round_id, buckets } => {
                self.peers.observe(from_client_id, &self.config.node_id);
                let bucket_set: std::collections::HashSet<usize> = buckets.iter().copied().collect();
                let entries: Vec<_> = self
                    .store
                    .all_entries()
                    .into_iter()
                    .filter(|e| bucket_set.contains(&merkle::bucket_for(&e.key)))
                    .map(|e| e.to_change_event())
                    .collect();
                let response = AeMessage::EntryResponse { round_id: *round_id, from_client_id: self.config.client_id.clone(), entries };
                if let Err(e) = self.send_to(from_client_id, &response).await {
                    warn!("failed to send entry response to {from_client_id}: {e}");
                }
            }
            AeMessage::DigestResponse { round_id, .. } | AeMessage::EntryResponse { round_id, .. } => {
                if let Some(tx) = self.pending.lock().unwrap().remove(round_id) {
                    let _ = tx.send(msg);
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battery::{BatteryStatus, StubBatterySource};
    use crate::store::MemoryEngine;

    fn manager() -> AntiEntropyManager {
        let config = Config::new("127.0.0.1", "test-device", "test-node");
        let store: Arc<dyn StorageEngine> = Arc::new(MemoryEngine::new());
        let metrics = Arc::new(Metrics::default());
        let battery_source: Arc<dyn crate::battery::BatterySource> = Arc::new(StubBatterySource::new(BatteryStatus::default()));
        let battery = Arc::new(BatteryAdapter::new(battery_source, config.battery_config.clone()));
        let (session, _connection_rx, _frame_rx) = MqttSession::start(&config);
        let peers = Arc::new(PeerRegistry::new(Vec::new()));
        AntiEntropyManager::new(store, session, config, metrics, battery, peers)
    }

    #[tokio::test]
    async fn round_guard_cleans_up_pending_entry_on_drop() {
        let manager = manager();
        let (round_id, _rx) = manager.register_round();
        assert_eq!(manager.pending.lock().unwrap().len(), 1);
        {
            let _guard = manager.round_guard(round_id);
        }
        assert!(manager.pending.lock().unwrap().is_empty());
    }

    #[test]
    fn discovers_peers_without_static_configuration() {
        let registry = PeerRegistry::new(Vec::new());
        assert!(registry.snapshot().is_empty());
        registry.observe("node-b", "node-a");
        assert_eq!(registry.snapshot(), vec!["node-b".to_string()]);
    }

    #[test]
    fn never_observes_itself() {
        let registry = PeerRegistry::new(Vec::new());
        registry.observe("node-a", "node-a");
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn static_and_discovered_peers_are_deduplicated() {
        let registry = PeerRegistry::new(vec!["node-b".to_string()]);
        registry.observe("node-b", "node-a");
        registry.observe("node-c", "node-a");
        let mut snapshot = registry.snapshot();
        snapshot.sort();
        assert_eq!(snapshot, vec!["node-b".to_string(), "node-c".to_string()]);
    }
}
