//! # Offline Queue Processor
//!
//! Drain loop for the offline operation queue (§4.7). Single-flighted: a
//! trigger that arrives while a drain is already running is a no-op,
//! because the in-flight drain re-reads the backing store on every batch
//! and will pick up anything enqueued in the meantime.
//!
//! Each queued command is executed through
//! [`crate::command::processor::CommandProcessor::execute`] — the same
//! entry point live MQTT-delivered commands use — closing the open
//! question §9 raises about the source's stubbed execution path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use tokio::sync::watch;

use crate::battery::BatteryAdapter;
use crate::command::types::{Command, Status};
use crate::error::Result;
use crate::metrics::{inc, Metrics};
use crate::queue::store::QueueStore;
use crate::queue::types::{Priority, QueueStats, QueuedOperation};

pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
}

/// A signature matching [`crate::command::processor::CommandProcessor::execute`],
/// parameterized so unit tests can stand in a fake without building a real
/// processor + storage engine.
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, client_id: &str, command: Command) -> crate::command::types::Response;
}

impl CommandExecutor for crate::command::processor::CommandProcessor {
    fn execute(&self, client_id: &str, command: Command) -> crate::command::types::Response {
        crate::command::processor::CommandProcessor::execute(self, client_id, command)
    }
}

pub struct OfflineQueue {
    store: Arc<dyn QueueStore>,
    battery: Arc<BatteryAdapter>,
    metrics: Arc<Metrics>,
    capacity: usize,
    max_age_ms: u64,
    max_retry_attempts: u32,
    base_batch_size: usize,
    processing: AtomicBool,
    total_processed: AtomicU64,
    total_failed: AtomicU64,
    total_dropped: AtomicU64,
    stats_tx: watch::Sender<QueueStats>,
}

impl OfflineQueue {
    pub fn new(
        store: Arc<dyn QueueStore>,
        battery: Arc<BatteryAdapter>,
        metrics: Arc<Metrics>,
        capacity: usize,
        max_age_ms: u64,
        max_retry_attempts: u32,
        base_batch_size: usize,
    ) -> (Arc<Self>, watch::Receiver<QueueStats>) {
        let (stats_tx, stats_rx) = watch::channel(QueueStats::default());
        let queue = Arc::new(Self {
            store,
            battery,
            metrics,
            capacity,
            max_age_ms,
            max_retry_attempts,
            base_batch_size,
            processing: AtomicBool::new(false),
            total_processed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
            stats_tx,
        });
        let _ = queue.publish_stats();
        (queue, stats_rx)
    }

    /// Buffer `command` at `priority`. Triggers a drain immediately when
    /// `is_connected` is true (§4.7: "new enqueue while Connected" is a
    /// processing trigger); the caller is responsible for actually invoking
    /// [`Self::drain`] in that case since this method has no access to the
    /// command executor.
    pub fn enqueue(&self, command: &Command, priority: Priority) -> Result<String> {
        let op = QueuedOperation::new(command, priority, now_ms())?;
        let operation_id = op.operation_id.clone();
        self.store.store_operation(&op)?;
        inc!(self.metrics.queue_enqueued);
        let dropped = self.enforce_capacity()?;
        if dropped > 0 {
            self.total_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
            self.metrics.queue_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
            warn!("offline queue over capacity, dropped {dropped} operations");
        }
        self.publish_stats()?;
        Ok(operation_id)
    }

    /// Evict oldest Low, then Normal, then High until at or under capacity
    /// (§4.7). Returns the number evicted.
    fn enforce_capacity(&self) -> Result<usize> {
        let total = self.store.count(Priority::Low)? + self.store.count(Priority::Normal)? + self.store.count(Priority::High)?;
        if total <= self.capacity {
            return Ok(0);
        }
        let mut over = total - self.capacity;
        let mut dropped = 0usize;
        for priority in [Priority::Low, Priority::Normal, Priority::High] {
            if over == 0 {
                break;
            }
            let available = self.store.count(priority)?;
            let evict_n = over.min(available);
            if evict_n > 0 {
                let evicted = self.store.evict_oldest(priority, evict_n)?;
                dropped += evicted;
                over = over.saturating_sub(evicted);
            }
        }
        Ok(dropped)
    }

    /// Remove operations older than `max_age` (§3: default 7 days). Run on
    /// an hourly cadence by the owning client and once at the start of
    /// every [`Self::drain`].
    pub fn cleanup_expired(&self) -> Result<usize> {
        let removed = self.store.remove_expired(now_ms(), self.max_age_ms)?;
        if removed > 0 {
            debug!("offline queue reaped {removed} expired operations");
            self.publish_stats()?;
        }
        Ok(removed)
    }

    fn publish_stats(&self) -> Result<()> {
        let high_count = self.store.count(Priority::High)?;
        let normal_count = self.store.count(Priority::Normal)?;
        let low_count = self.store.count(Priority::Low)?;
        let oldest_age_ms = self
            .store
            .get_all_operations()?
            .iter()
            .map(|o| o.queued_at_ms)
            .min()
            .map(|oldest| now_ms().saturating_sub(oldest));
        let stats = QueueStats {
            high_count,
            normal_count,
            low_count,
            total_processed: self.total_processed.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            oldest_age_ms,
            last_flush_at_ms: self.stats_tx.borrow().last_flush_at_ms,
        };
        let _ = self.stats_tx.send(stats);
        Ok(())
    }

    /// Drain the queue in strict priority + FIFO order, executing each
    /// command through `executor` on behalf of `client_id`. Re-checks
    /// `is_connected` between (and within) batches; halts immediately on
    /// disconnect and resumes on the next trigger (§4.7). A no-op if a
    /// drain is already in flight (single-flighted).
    pub fn drain(&self, client_id: &str, executor: &dyn CommandExecutor, is_connected: &dyn Fn() -> bool) {
        if self.processing.swap(true, Ordering::SeqCst) {
            debug!("offline queue drain already in flight, skipping trigger");
            return;
        }
        let _ = self.cleanup_expired();

        loop {
            if !is_connected() {
                break;
            }
            let batch_size = self.battery.effective_batch_size(self.base_batch_size);
            let pending = match self.store.get_all_operations() {
                Ok(ops) => ops,
                Err(e) => {
                    warn!("offline queue failed to list operations: {e}");
                    break;
                }
            };
            if pending.is_empty() {
                break;
            }
            let throttle_low = self.battery.should_throttle_low_priority();

            let mut made_progress = false;
            for op in pending.into_iter().take(batch_size) {
                if !is_connected() {
                    self.processing.store(false, Ordering::SeqCst);
                    let _ = self.publish_stats();
                    return;
                }
                if throttle_low && op.priority == Priority::Low {
                    continue;
                }
                made_progress = true;
                self.execute_one(client_id, executor, op);
            }
            if !made_progress {
                // Everything left in this batch was throttled Low-priority
                // work; stop for now rather than spinning.
                break;
            }
        }

        self.processing.store(false, Ordering::SeqCst);
        {
            let mut stats = self.stats_tx.borrow().clone();
            stats.last_flush_at_ms = Some(now_ms());
            let _ = self.stats_tx.send(stats);
        }
        let _ = self.publish_stats();
    }

    fn execute_one(&self, client_id: &str, executor: &dyn CommandExecutor, op: QueuedOperation) {
        let command = match op.decode_command() {
            Ok(c) => c,
            Err(e) => {
                warn!("dropping queued operation {} with undecodable command: {e}", op.operation_id);
                let _ = self.store.remove_operation(&op.operation_id);
                self.total_failed.fetch_add(1, Ordering::Relaxed);
                inc!(self.metrics.queue_failed);
                return;
            }
        };

        let response = executor.execute(client_id, command);
        if response.status == Status::Ok {
            let _ = self.store.remove_operation(&op.operation_id);
            self.total_processed.fetch_add(1, Ordering::Relaxed);
            inc!(self.metrics.queue_processed);
            return;
        }

        let attempts = op.attempts + 1;
        if attempts >= self.max_retry_attempts {
            warn!(
                "queued operation {} ({}) exhausted {attempts} attempts, last error: {:?}",
                op.operation_id, op.operation_type, response.error
            );
            let _ = self.store.remove_operation(&op.operation_id);
            self.total_failed.fetch_add(1, Ordering::Relaxed);
            inc!(self.metrics.queue_failed);
        } else {
            let mut updated = op;
            updated.attempts = attempts;
            updated.last_error = response.error.clone();
            if let Err(e) = self.store.update_operation(&updated) {
                warn!("failed to persist retry state for {}: {e}", updated.operation_id);
            }
            info!("queued operation {} failed (attempt {attempts}/{}), will retry", updated.operation_id, self.max_retry_attempts);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battery::{BatteryAdapter, BatteryStatus, StubBatterySource};
    use crate::command::types::{Op, Response};
    use crate::config::BatteryConfig;
    use crate::queue::store::InMemoryQueueStore;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct FakeExecutor {
        calls: StdMutex<Vec<String>>,
        fail_keys: Vec<String>,
    }

    impl CommandExecutor for FakeExecutor {
        fn execute(&self, _client_id: &str, command: Command) -> Response {
            let key = match &command.op {
                Op::Set { key, .. } => key.clone(),
                Op::Get { key } => key.clone(),
                _ => "?".to_string(),
            };
            self.calls.lock().unwrap().push(key.clone());
            if self.fail_keys.contains(&key) {
                Response::error(command.id, crate::error::ErrorCode::InternalError, "simulated failure")
            } else {
                Response::ok(command.id)
            }
        }
    }

    fn full_battery() -> Arc<BatteryAdapter> {
        Arc::new(BatteryAdapter::new(Arc::new(StubBatterySource::new(BatteryStatus { level_pct: 100, is_charging: true })), BatteryConfig::default()))
    }

    fn queue() -> Arc<OfflineQueue> {
        let (q, _rx) = OfflineQueue::new(Arc::new(InMemoryQueueStore::new()), full_battery(), Arc::new(Metrics::default()), 10_000, 7 * 24 * 3_600_000, 3, 50);
        q
    }

    fn set_cmd(id: &str, key: &str) -> Command {
        Command { id: id.into(), op: Op::Set { key: key.into(), value: "v".into() } }
    }

    #[test]
    fn drain_processes_high_before_low_fifo() {
        let q = queue();
        q.enqueue(&set_cmd("h1", "a"), Priority::High).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        q.enqueue(&set_cmd("l1", "b"), Priority::Low).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        q.enqueue(&set_cmd("h2", "c"), Priority::High).unwrap();

        let executor = FakeExecutor { calls: StdMutex::new(vec![]), fail_keys: vec![] };
        q.drain("dev-1", &executor, &|| true);

        let order = executor.calls.lock().unwrap().clone();
        assert_eq!(order, vec!["a", "c", "b"]);
    }

    #[test]
    fn drain_halts_on_disconnect_and_resumes() {
        let q = queue();
        q.enqueue(&set_cmd("h1", "a"), Priority::High).unwrap();
        q.enqueue(&set_cmd("h2", "b"), Priority::High).unwrap();

        let connected_once = AtomicUsize::new(0);
        let executor = FakeExecutor { calls: StdMutex::new(vec![]), fail_keys: vec![] };
        // First call to is_connected (before fetching batch) true, second
        // (before executing the 2nd op) false: simulates a disconnect
        // mid-batch.
        q.drain("dev-1", &executor, &|| connected_once.fetch_add(1, Ordering::SeqCst) < 2);
        assert_eq!(executor.calls.lock().unwrap().len(), 1);

        // Resume: the surviving operation drains on the next trigger.
        let executor2 = FakeExecutor { calls: StdMutex::new(vec![]), fail_keys: vec![] };
        q.drain("dev-1", &executor2, &|| true);
        assert_eq!(executor2.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn failed_operation_retries_then_drops_after_max_attempts() {
        let q = queue();
        q.enqueue(&set_cmd("f1", "bad"), Priority::Normal).unwrap();
        let executor = FakeExecutor { calls: StdMutex::new(vec![]), fail_keys: vec!["bad".to_string()] };

        q.drain("dev-1", &executor, &|| true);
        q.drain("dev-1", &executor, &|| true);
        q.drain("dev-1", &executor, &|| true);
        assert_eq!(executor.calls.lock().unwrap().len(), 3);

        // Fourth drain: nothing left, no more calls.
        q.drain("dev-1", &executor, &|| true);
        assert_eq!(executor.calls.lock().unwrap().len(), 3);
        assert_eq!(q.total_failed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn capacity_overflow_evicts_oldest_low_first() {
        let (q, _rx) = OfflineQueue::new(Arc::new(InMemoryQueueStore::new()), full_battery(), Arc::new(Metrics::default()), 2, 7 * 24 * 3_600_000, 3, 50);
        q.enqueue(&set_cmd("l1", "a"), Priority::Low).unwrap();
        q.enqueue(&set_cmd("n1", "b"), Priority::Normal).unwrap();
        q.enqueue(&set_cmd("h1", "c"), Priority::High).unwrap();

        let executor = FakeExecutor { calls: StdMutex::new(vec![]), fail_keys: vec![] };
        q.drain("dev-1", &executor, &|| true);
        let order = executor.calls.lock().unwrap().clone();
        assert_eq!(order, vec!["b", "c"]);
        assert_eq!(q.total_dropped.load(Ordering::Relaxed), 1);
    }
}
