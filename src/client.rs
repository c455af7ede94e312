//! # Client Facade
//!
//! [`MerkleKvClient`] is the public entry point (§6): it owns the storage
//! engine, the MQTT session, the command processor, the replication
//! publisher/subscriber, the anti-entropy manager, and the offline queue,
//! and wires them together the way the teacher's `main.rs` wires a
//! `Server` to a `Replicator` and a `Store` — except here the wiring
//! happens once, inside `connect`, rather than being spread across a CLI
//! entry point.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use tokio::sync::{mpsc, watch};

use crate::anti_entropy::{AntiEntropyManager, PeerRegistry};
use crate::battery::{BatteryAdapter, BatterySource, StubBatterySource, BatteryStatus};
use crate::command::processor::{CommandProcessor, TimeoutClass};
use crate::command::types::{Command, Op, Response, Status};
use crate::config::Config;
use crate::error::{MkvError, Result};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::model::ChangeEvent;
use crate::mqtt::{ConnectionEvent, ConnectionState, InboundFrame, MqttSession};
use crate::queue::{InMemoryQueueStore, OfflineQueue, Priority, QueueStats, QueueStore, SqliteQueueStore};
use crate::replication::{ReplicationPublisher, ReplicationSubscriber};
use crate::scheduler::{with_deadline, CancellationHandle};
use crate::store::{self, StorageEngine};

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
}

/// Everything needed to run a device's MerkleKV Mobile session (§6). One
/// instance corresponds to one logical mobile client.
pub struct MerkleKvClient {
    config: Config,
    store: Arc<dyn StorageEngine>,
    processor: Arc<CommandProcessor>,
    metrics: Arc<Metrics>,
    battery: Arc<BatteryAdapter>,
    queue: Arc<OfflineQueue>,
    request_seq: AtomicU64,

    session: Arc<MqttSession>,
    connection_rx: watch::Receiver<ConnectionEvent>,
    queue_stats_rx: watch::Receiver<QueueStats>,
    cancel: CancellationHandle,
}

impl MerkleKvClient {
    /// Build and connect a client (§6: "create" then "connect" are
    /// collapsed here since nothing useful happens between them — a
    /// disconnected client is just a freshly-opened `MqttSession` whose
    /// reconnect loop hasn't gotten an ack yet).
    pub fn connect(config: Config) -> Result<Self> {
        config.validate()?;

        let store = store::create_engine(&config)?;
        let metrics = Arc::new(Metrics::default());

        let battery_source: Arc<dyn BatterySource> = Arc::new(StubBatterySource::new(BatteryStatus::default()));
        let battery = Arc::new(BatteryAdapter::new(battery_source, config.battery_config.clone()));

        let (events_tx, events_rx) = mpsc::unbounded_channel::<ChangeEvent>();
        let processor = Arc::new(
            CommandProcessor::new(store.clone(), config.node_id.clone(), config.skew_max_future_ms, metrics.clone()).with_events_channel(events_tx),
        );

        let (session, connection_rx, mut frame_rx) = MqttSession::start(&config);

        let publisher = ReplicationPublisher::new(session.clone(), events_rx, metrics.clone());
        tokio::spawn(publisher.run());

        let peers = Arc::new(PeerRegistry::new(config.anti_entropy_peers.clone()));

        let subscriber = Arc::new(ReplicationSubscriber::new(
            store.clone(),
            config.node_id.clone(),
            config.skew_max_future_ms,
            metrics.clone(),
            peers.clone(),
        ));

        let anti_entropy = Arc::new(AntiEntropyManager::new(store.clone(), session.clone(), config.clone(), metrics.clone(), battery.clone(), peers.clone()));

        let queue_store: Arc<dyn QueueStore> = match &config.queue_storage_path {
            Some(path) => Arc::new(SqliteQueueStore::open(path)?),
            None => Arc::new(InMemoryQueueStore::new()),
        };
        let (queue, queue_stats_rx) = OfflineQueue::new(
            queue_store,
            battery.clone(),
            metrics.clone(),
            config.queue_capacity,
            config.queue_max_age_h * 3_600_000,
            config.queue_max_retry_attempts,
            config.queue_batch_size,
        );

        let cancel = CancellationHandle::new();

        // Inbound dispatch (§4.2): commands answered locally and published
        // to the response topic, replication frames applied, anything that
        // doesn't parse as either handed to anti-entropy.
        {
            let processor = processor.clone();
            let subscriber = subscriber.clone();
            let anti_entropy = anti_entropy.clone();
            let session = session.clone();
            let client_id = config.client_id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        frame = frame_rx.recv() => {
                            let Some(frame) = frame else { break };
                            match frame {
                                InboundFrame::Command(bytes) => {
                                    match serde_json::from_slice::<Command>(&bytes) {
                                        Ok(command) => {
                                            let response = processor.execute(&client_id, command);
                                            if let Ok(payload) = serde_json::to_vec(&response) {
                                                if let Err(e) = session.publish_response(payload).await {
                                                    warn!("failed to publish response: {e}");
                                                }
                                            }
                                        }
                                        Err(_) => {
                                            anti_entropy.handle_inbound(&bytes).await;
                                        }
                                    }
                                }
                                InboundFrame::Replication(bytes) => subscriber.apply_frame(&bytes),
                            }
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
            });
        }

        // Anti-entropy background loop (§4.6).
        {
            let anti_entropy = anti_entropy.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { anti_entropy.run(cancel).await });
        }

        // Offline queue drain trigger (§4.7): re-drain on every transition
        // to Connected, and an hourly sweep for expiry regardless of
        // connectivity.
        {
            let queue = queue.clone();
            let processor = processor.clone();
            let client_id = config.client_id.clone();
            let mut connection_rx = connection_rx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = connection_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let state = connection_rx.borrow().state;
                            if state == ConnectionState::Connected {
                                let processor = processor.clone();
                                let client_id = client_id.clone();
                                let rx = connection_rx.clone();
                                let queue = queue.clone();
                                tokio::task::spawn_blocking(move || {
                                    queue.drain(&client_id, processor.as_ref(), &|| rx.borrow().state == ConnectionState::Connected);
                                });
                            }
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
            });
        }
        {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(3600)) => {
                            let queue = queue.clone();
                            let _ = tokio::task::spawn_blocking(move || queue.cleanup_expired()).await;
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
            });
        }

        // Tombstone reaping (§3: "invoked by a periodic maintenance task,
        // not inline with every write"). Runs on the same cadence as the
        // queue expiry sweep.
        {
            let store = store.clone();
            let retention_ms = config.tombstone_retention().as_millis() as u64;
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(3600)) => {
                            let store = store.clone();
                            let reaped = tokio::task::spawn_blocking(move || store.reap_tombstones(now_ms(), retention_ms)).await;
                            if let Ok(n) = reaped {
                                if n > 0 {
                                    info!("reaped {n} expired tombstones");
                                }
                            }
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
            });
        }

        info!("merkle_kv_mobile client started for client_id={}", config.client_id);

        Ok(Self {
            config,
            store,
            processor,
            metrics,
            battery,
            queue,
            request_seq: AtomicU64::new(0),
            session,
            connection_rx,
            queue_stats_rx,
            cancel,
        })
    }

    fn next_request_id(&self) -> String {
        format!("{}-{}", self.config.client_id, self.request_seq.fetch_add(1, Ordering::SeqCst))
    }

    fn is_connected(&self) -> bool {
        self.connection_rx.borrow().state == ConnectionState::Connected
    }

    /// Execute `op` locally if connected, or buffer it in the offline queue
    /// otherwise (§4.7). Read-only ops (GET/MGET) are never queued — there
    /// is nothing useful to do with a stale answer delivered later, so a
    /// disconnected read fails fast with `ErrorCode::Connection` instead
    /// (open question resolved in DESIGN.md).
    async fn dispatch(&self, op: Op, priority: Priority) -> Result<Response> {
        let id = self.next_request_id();
        let command = Command { id: id.clone(), op };

        if self.is_connected() {
            let processor = self.processor.clone();
            let client_id = self.config.client_id.clone();
            let timeout = TimeoutClass::for_op(&command.op).duration();
            let response = with_deadline(
                tokio::task::spawn_blocking(move || processor.execute(&client_id, command)),
                timeout,
            )
            .await?
            .map_err(|e| MkvError::storage(format!("command task panicked: {e}")))?;
            return Ok(response);
        }

        if !command.op.is_mutation() {
            return Err(MkvError::not_connected("cannot serve a read while disconnected"));
        }

        let queue = self.queue.clone();
        let command_clone = command.clone();
        tokio::task::spawn_blocking(move || queue.enqueue(&command_clone, priority))
            .await
            .map_err(|e| MkvError::storage(format!("enqueue task panicked: {e}")))??;
        Ok(Response::ok(id))
    }

    pub async fn get(&self, key: impl Into<String>) -> Result<Option<String>> {
        let response = self.dispatch(Op::Get { key: key.into() }, Priority::Normal).await?;
        match response.status {
            Status::Ok => Ok(response.value),
            Status::Error if response.error_code == Some(crate::error::ErrorCode::NotFound) => Ok(None),
            Status::Error => Err(MkvError::not_found(response.error.unwrap_or_default())),
        }
    }

    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.set_with_priority(key, value, Priority::Normal).await
    }

    pub async fn set_with_priority(&self, key: impl Into<String>, value: impl Into<String>, priority: Priority) -> Result<()> {
        let response = self.dispatch(Op::Set { key: key.into(), value: value.into() }, priority).await?;
        into_unit(response)
    }

    pub async fn delete(&self, key: impl Into<String>) -> Result<()> {
        let response = self.dispatch(Op::Del { key: key.into() }, Priority::Normal).await?;
        into_unit(response)
    }

    pub async fn increment(&self, key: impl Into<String>, amount: i64) -> Result<i64> {
        let response = self.dispatch(Op::Incr { key: key.into(), amount: Some(amount) }, Priority::Normal).await?;
        into_i64(response)
    }

    pub async fn decrement(&self, key: impl Into<String>, amount: i64) -> Result<i64> {
        let response = self.dispatch(Op::Decr { key: key.into(), amount: Some(amount) }, Priority::Normal).await?;
        into_i64(response)
    }

    pub async fn append(&self, key: impl Into<String>, value: impl Into<String>) -> Result<usize> {
        let response = self.dispatch(Op::Append { key: key.into(), value: value.into() }, Priority::Normal).await?;
        into_usize(response)
    }

    pub async fn prepend(&self, key: impl Into<String>, value: impl Into<String>) -> Result<usize> {
        let response = self.dispatch(Op::Prepend { key: key.into(), value: value.into() }, Priority::Normal).await?;
        into_usize(response)
    }

    pub async fn get_multiple(&self, keys: Vec<String>) -> Result<Vec<Option<String>>> {
        let response = self.dispatch(Op::Mget { keys }, Priority::Normal).await?;
        let results = response.results.ok_or_else(|| MkvError::storage("mget response missing results"))?;
        Ok(results.into_iter().map(|r| r.value).collect())
    }

    pub async fn set_multiple(&self, pairs: Vec<(String, String)>) -> Result<()> {
        let response = self.dispatch(Op::Mset { key_values: pairs }, Priority::Normal).await?;
        response.results.ok_or_else(|| MkvError::storage("mset response missing results"))?;
        Ok(())
    }

    /// Live connection-state stream (§4.2), for UI and reconnect-aware
    /// callers.
    pub fn connection_events(&self) -> watch::Receiver<ConnectionEvent> {
        self.connection_rx.clone()
    }

    /// Live offline-queue statistics stream (§4.7), e.g. for a "N
    /// operations pending sync" indicator.
    pub fn queue_stats(&self) -> watch::Receiver<QueueStats> {
        self.queue_stats_rx.clone()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn storage_len(&self) -> usize {
        self.store.len()
    }

    /// Explicit disconnect (§4.2): stops the reconnect loop and every
    /// background task started by [`Self::connect`]. The client instance
    /// is still usable afterward only for local storage reads; further
    /// writes queue and never drain until a new client is created.
    pub async fn disconnect(&self) {
        self.cancel.cancel();
        self.session.shutdown().await;
    }

    /// Tear down and flush. Equivalent to `disconnect` followed by a
    /// storage flush (§6's "dispose").
    pub async fn dispose(self) -> Result<()> {
        self.disconnect().await;
        self.store.flush()
    }
}

fn into_unit(response: Response) -> Result<()> {
    match response.status {
        Status::Ok => Ok(()),
        Status::Error => Err(error_from_response(response)),
    }
}

fn into_i64(response: Response) -> Result<i64> {
    match response.status {
        Status::Ok => response
            .value
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or_else(|| MkvError::storage("counter response missing a parseable value")),
        Status::Error => Err(error_from_response(response)),
    }
}

fn into_usize(response: Response) -> Result<usize> {
    match response.status {
        Status::Ok => response
            .value
            .and_then(|v| v.parse::<usize>().ok())
            .ok_or_else(|| MkvError::storage("length response missing a parseable value")),
        Status::Error => Err(error_from_response(response)),
    }
}

fn error_from_response(response: Response) -> MkvError {
    match response.error_code {
        Some(crate::error::ErrorCode::NotFound) => MkvError::not_found(response.error.unwrap_or_default()),
        Some(crate::error::ErrorCode::PayloadTooLarge) => MkvError::payload_too_large(response.error.unwrap_or_default()),
        Some(crate::error::ErrorCode::Connection) => MkvError::not_connected(response.error.unwrap_or_default()),
        _ => MkvError::invalid_request(response.error.unwrap_or_default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_against_unreachable_broker_still_constructs() {
        // rumqttc's eventloop dials lazily on first poll, so construction
        // succeeds even when nothing is listening; the reconnect loop then
        // retries with backoff in the background.
        let config = Config::new("127.0.0.1", "test-device", "test-node");
        let client = MerkleKvClient::connect(config).unwrap();
        assert_eq!(client.storage_len(), 0);
        client.disconnect().await;
    }
}
