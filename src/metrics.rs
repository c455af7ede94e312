//! # Metrics
//!
//! A flat set of atomic counters surfaced through
//! [`crate::client::MerkleKvClient::metrics_snapshot`], mirroring the shape
//! (not the exact fields) of the teacher's `ServerStats`: counters are held
//! behind `Arc` and shared by every component that needs to bump them, then
//! read out into a plain, serializable snapshot on demand. This crate emits
//! metrics; shipping them anywhere (Prometheus, StatsD, a dashboard) is the
//! out-of-scope sink's job (§1).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Metrics {
    pub replication_published: AtomicU64,
    pub replication_applied: AtomicU64,
    pub replication_dropped_self: AtomicU64,
    pub replication_dropped_skew: AtomicU64,
    pub replication_dropped_duplicate: AtomicU64,
    pub replication_decode_errors: AtomicU64,
    pub anti_entropy_rounds_completed: AtomicU64,
    pub anti_entropy_rounds_abandoned: AtomicU64,
    pub anti_entropy_entries_pulled: AtomicU64,
    pub queue_enqueued: AtomicU64,
    pub queue_processed: AtomicU64,
    pub queue_failed: AtomicU64,
    pub queue_dropped: AtomicU64,
    pub idempotency_cache_hits: AtomicU64,
    pub idempotency_cache_misses: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub replication_published: u64,
    pub replication_applied: u64,
    pub replication_dropped_self: u64,
    pub replication_dropped_skew: u64,
    pub replication_dropped_duplicate: u64,
    pub replication_decode_errors: u64,
    pub anti_entropy_rounds_completed: u64,
    pub anti_entropy_rounds_abandoned: u64,
    pub anti_entropy_entries_pulled: u64,
    pub queue_enqueued: u64,
    pub queue_processed: u64,
    pub queue_failed: u64,
    pub queue_dropped: u64,
    pub idempotency_cache_hits: u64,
    pub idempotency_cache_misses: u64,
}

macro_rules! inc {
    ($field:expr) => {
        $field.fetch_add(1, Ordering::Relaxed)
    };
}
pub(crate) use inc;

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            replication_published: self.replication_published.load(Ordering::Relaxed),
            replication_applied: self.replication_applied.load(Ordering::Relaxed),
            replication_dropped_self: self.replication_dropped_self.load(Ordering::Relaxed),
            replication_dropped_skew: self.replication_dropped_skew.load(Ordering::Relaxed),
            replication_dropped_duplicate: self.replication_dropped_duplicate.load(Ordering::Relaxed),
            replication_decode_errors: self.replication_decode_errors.load(Ordering::Relaxed),
            anti_entropy_rounds_completed: self.anti_entropy_rounds_completed.load(Ordering::Relaxed),
            anti_entropy_rounds_abandoned: self.anti_entropy_rounds_abandoned.load(Ordering::Relaxed),
            anti_entropy_entries_pulled: self.anti_entropy_entries_pulled.load(Ordering::Relaxed),
            queue_enqueued: self.queue_enqueued.load(Ordering::Relaxed),
            queue_processed: self.queue_processed.load(Ordering::Relaxed),
            queue_failed: self.queue_failed.load(Ordering::Relaxed),
            queue_dropped: self.queue_dropped.load(Ordering::Relaxed),
            idempotency_cache_hits: self.idempotency_cache_hits.load(Ordering::Relaxed),
            idempotency_cache_misses: self.idempotency_cache_misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let metrics = Metrics::default();
        inc!(metrics.replication_applied);
        inc!(metrics.replication_applied);
        let snap = metrics.snapshot();
        assert_eq!(snap.replication_applied, 2);
        assert_eq!(snap.replication_published, 0);
    }
}
