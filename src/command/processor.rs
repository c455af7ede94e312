//! # Command Processor
//!
//! Executes a [`Command`] against a [`StorageEngine`] (§4.4): validates
//! structure and limits, resolves idempotency, performs the per-op
//! semantics, assigns `seq`, and hands any resulting [`ChangeEvent`] to the
//! replication publish pipeline via an unbounded channel (mirroring the
//! teacher's `server.rs` pattern of collecting an outbound action and
//! publishing it only after the storage lock is released).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc::UnboundedSender;

use crate::command::idempotency::IdempotencyCache;
use crate::command::types::{Command, Op, Response, ResultItem};
use crate::error::ErrorCode;
use crate::metrics::{inc, Metrics};
use crate::model::{ChangeEvent, StorageEntry, MAX_KEY_BYTES, MAX_VALUE_BYTES};
use crate::store::StorageEngine;
use std::sync::Mutex;

pub const MAX_COMMAND_BYTES: usize = 524_288;
pub const MAX_MGET_KEYS: usize = 256;
pub const MAX_MSET_PAIRS: usize = 100;

/// Timeout classes from §4.4, used by callers awaiting a broker ack or a
/// command's response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    SingleKey,
    MultiKey,
    Sync,
}

impl TimeoutClass {
    pub fn duration(self) -> Duration {
        match self {
            TimeoutClass::SingleKey => Duration::from_secs(10),
            TimeoutClass::MultiKey => Duration::from_secs(20),
            TimeoutClass::Sync => Duration::from_secs(30),
        }
    }

    pub fn for_op(op: &Op) -> Self {
        match op {
            Op::Mget { .. } | Op::Mset { .. } => TimeoutClass::MultiKey,
            _ => TimeoutClass::SingleKey,
        }
    }
}

pub struct CommandProcessor {
    store: Arc<dyn StorageEngine>,
    node_id: String,
    seq: AtomicU64,
    idempotency: Mutex<IdempotencyCache>,
    skew_max_future_ms: u64,
    events_tx: Option<UnboundedSender<ChangeEvent>>,
    metrics: Arc<Metrics>,
}

impl CommandProcessor {
    pub fn new(store: Arc<dyn StorageEngine>, node_id: impl Into<String>, skew_max_future_ms: u64, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            node_id: node_id.into(),
            seq: AtomicU64::new(0),
            idempotency: Mutex::new(IdempotencyCache::default()),
            skew_max_future_ms,
            events_tx: None,
            metrics,
        }
    }

    /// Wire up the channel the replication publisher reads from. A
    /// processor without a sender still executes commands correctly; it
    /// just has nothing to replicate to.
    pub fn with_events_channel(mut self, tx: UnboundedSender<ChangeEvent>) -> Self {
        self.events_tx = Some(tx);
        self
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn now_ms() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
    }

    /// Execute a command on behalf of `client_id`. Never panics on bad
    /// input; malformed or oversize commands return an `ERROR` response
    /// rather than an `Err`.
    pub fn execute(&self, client_id: &str, command: Command) -> Response {
        let id = command.id.clone();

        if let Ok(bytes) = serde_json::to_vec(&command) {
            if bytes.len() > MAX_COMMAND_BYTES {
                return Response::error(
                    id,
                    ErrorCode::PayloadTooLarge,
                    format!("command size {} exceeds {} bytes", bytes.len(), MAX_COMMAND_BYTES),
                );
            }
        }

        {
            let mut cache = self.idempotency.lock().unwrap();
            if let Some(cached) = cache.get(client_id, &id) {
                inc!(self.metrics.idempotency_cache_hits);
                return cached.response;
            }
        }
        inc!(self.metrics.idempotency_cache_misses);

        let (response, emitted) = self.dispatch(&id, command.op);

        let mut cache = self.idempotency.lock().unwrap();
        cache.insert(client_id, &id, response.clone(), emitted);
        response
    }

    fn dispatch(&self, id: &str, op: Op) -> (Response, Vec<(String, u64)>) {
        match op {
            Op::Get { key } => (self.do_get(id, &key), vec![]),
            Op::Set { key, value } => self.do_set(id, key, value),
            Op::Del { key } => self.do_del(id, key),
            Op::Incr { key, amount } => self.do_incr_decr(id, key, amount.unwrap_or(1)),
            Op::Decr { key, amount } => match amount.unwrap_or(1).checked_neg() {
                Some(delta) => self.do_incr_decr(id, key, delta),
                None => (Response::error(id, ErrorCode::InvalidRequest, "integer overflow"), vec![]),
            },
            Op::Append { key, value } => self.do_append_prepend(id, key, value, true),
            Op::Prepend { key, value } => self.do_append_prepend(id, key, value, false),
            Op::Mget { keys } => (self.do_mget(id, keys), vec![]),
            Op::Mset { key_values } => self.do_mset(id, key_values),
        }
    }

    fn do_get(&self, id: &str, key: &str) -> Response {
        match self.store.get(key) {
            Some(entry) if !entry.is_tombstone => Response::ok_value(id, entry.value.unwrap_or_default()),
            _ => Response::error(id, ErrorCode::NotFound, ErrorCode::NotFound.default_message()),
        }
    }

    /// Build, validate, and apply one entry. Returns the event to
    /// replicate plus whether the entry actually won LWW and changed
    /// storage (the caller decides how to wrap it in a `Response`, and
    /// must only publish/report the new value when `changed` is true — a
    /// losing write (stale local clock, or an equal/newer entry already
    /// applied via replication) must not overwrite the caller's view of
    /// the key with a value that was never actually stored).
    fn apply_mutation(&self, key: String, value: Option<String>, is_tombstone: bool) -> Result<(ChangeEvent, bool), Response> {
        let now = Self::now_ms();
        let entry = StorageEntry { key, value, is_tombstone, timestamp_ms: now, node_id: self.node_id.clone(), seq: self.next_seq() };

        if let Err(e) = entry.validate_sizes() {
            return Err(Response::error("", e.code(), e.to_string()));
        }
        if entry.timestamp_ms > now + self.skew_max_future_ms {
            return Err(Response::error("", ErrorCode::InvalidRequest, "timestamp too far in the future"));
        }

        match self.store.apply(entry.clone()) {
            Ok(changed) => Ok((entry.to_change_event(), changed)),
            Err(e) => Err(Response::error("", e.code(), e.to_string())),
        }
    }

    fn publish(&self, event: &ChangeEvent) -> Option<(String, u64)> {
        if let Some(tx) = &self.events_tx {
            let _ = tx.send(event.clone());
        }
        Some(event.dedup_key())
    }

    fn do_set(&self, id: &str, key: String, value: String) -> (Response, Vec<(String, u64)>) {
        if key.len() > MAX_KEY_BYTES || key.is_empty() {
            return (Response::error(id, ErrorCode::PayloadTooLarge, "key out of range"), vec![]);
        }
        if value.len() > MAX_VALUE_BYTES {
            return (Response::error(id, ErrorCode::PayloadTooLarge, "value out of range"), vec![]);
        }
        match self.apply_mutation(key, Some(value), false) {
            Ok((event, changed)) => {
                let emitted = if changed { self.publish(&event).into_iter().collect() } else { vec![] };
                (Response::ok(id), emitted)
            }
            Err(mut err) => {
                err.id = id.to_string();
                (err, vec![])
            }
        }
    }

    fn do_del(&self, id: &str, key: String) -> (Response, Vec<(String, u64)>) {
        match self.apply_mutation(key, None, true) {
            Ok((event, changed)) => {
                let emitted = if changed { self.publish(&event).into_iter().collect() } else { vec![] };
                (Response::ok(id), emitted)
            }
            Err(mut err) => {
                err.id = id.to_string();
                (err, vec![])
            }
        }
    }

    fn do_incr_decr(&self, id: &str, key: String, delta: i64) -> (Response, Vec<(String, u64)>) {
        let current: i64 = match self.store.get(&key) {
            Some(entry) if !entry.is_tombstone => {
                match entry.value.as_deref().unwrap_or("0").parse::<i64>() {
                    Ok(v) => v,
                    Err(_) => return (Response::error(id, ErrorCode::InvalidRequest, "existing value is not an integer"), vec![]),
                }
            }
            _ => 0,
        };
        let new_value = match current.checked_add(delta) {
            Some(v) => v,
            None => return (Response::error(id, ErrorCode::InvalidRequest, "integer overflow"), vec![]),
        };
        match self.apply_mutation(key.clone(), Some(new_value.to_string()), false) {
            Ok((event, changed)) => {
                let emitted = if changed { self.publish(&event).into_iter().collect() } else { vec![] };
                // A losing write (stale clock, or a newer value already
                // landed via replication) must report what is actually
                // stored, not the value this call computed but never
                // applied.
                let reported = if changed {
                    new_value
                } else {
                    self.store.get(&key).and_then(|e| e.value).and_then(|v| v.parse::<i64>().ok()).unwrap_or(new_value)
                };
                (Response::ok_value(id, reported.to_string()), emitted)
            }
            Err(mut err) => {
                err.id = id.to_string();
                (err, vec![])
            }
        }
    }

    fn do_append_prepend(&self, id: &str, key: String, value: String, append: bool) -> (Response, Vec<(String, u64)>) {
        // A tombstoned key is treated as absent (empty), matching SET-like
        // semantics — an open decision the source leaves unresolved (§9).
        let current = match self.store.get(&key) {
            Some(entry) if !entry.is_tombstone => entry.value.unwrap_or_default(),
            _ => String::new(),
        };
        let combined = if append { format!("{current}{value}") } else { format!("{value}{current}") };
        if combined.len() > MAX_VALUE_BYTES {
            return (Response::error(id, ErrorCode::PayloadTooLarge, "result exceeds value size limit"), vec![]);
        }
        let new_len = combined.len();
        match self.apply_mutation(key.clone(), Some(combined), false) {
            Ok((event, changed)) => {
                let emitted = if changed { self.publish(&event).into_iter().collect() } else { vec![] };
                let reported = if changed { new_len } else { self.store.get(&key).and_then(|e| e.value).map(|v| v.len()).unwrap_or(new_len) };
                (Response::ok_value(id, reported.to_string()), emitted)
            }
            Err(mut err) => {
                err.id = id.to_string();
                (err, vec![])
            }
        }
    }

    fn do_mget(&self, id: &str, keys: Vec<String>) -> Response {
        if keys.is_empty() || keys.len() > MAX_MGET_KEYS {
            return Response::error(id, ErrorCode::InvalidRequest, format!("mget keys must number 1..{MAX_MGET_KEYS}"));
        }
        let unique: HashSet<&String> = keys.iter().collect();
        if unique.len() != keys.len() {
            return Response::error(id, ErrorCode::InvalidRequest, "mget keys must be unique");
        }
        let results = keys
            .iter()
            .map(|k| match self.store.get(k) {
                Some(entry) if !entry.is_tombstone => ResultItem::ok_value(entry.value.unwrap_or_default()),
                _ => ResultItem::not_found(),
            })
            .collect();
        Response::ok_results(id, results)
    }

    fn do_mset(&self, id: &str, pairs: Vec<(String, String)>) -> (Response, Vec<(String, u64)>) {
        if pairs.is_empty() || pairs.len() > MAX_MSET_PAIRS {
            return (Response::error(id, ErrorCode::InvalidRequest, format!("mset pairs must number 1..{MAX_MSET_PAIRS}")), vec![]);
        }
        let mut results = Vec::with_capacity(pairs.len());
        let mut emitted = Vec::new();
        for (key, value) in pairs {
            if key.is_empty() || key.len() > MAX_KEY_BYTES {
                results.push(ResultItem::error(ErrorCode::PayloadTooLarge, "key out of range"));
                continue;
            }
            if value.len() > MAX_VALUE_BYTES {
                results.push(ResultItem::error(ErrorCode::PayloadTooLarge, "value out of range"));
                continue;
            }
            match self.apply_mutation(key, Some(value), false) {
                Ok((event, changed)) => {
                    if changed {
                        if let Some(dedup) = self.publish(&event) {
                            emitted.push(dedup);
                        }
                    }
                    results.push(ResultItem::ok());
                }
                Err(err) => results.push(ResultItem::error(err.error_code.unwrap_or(ErrorCode::InternalError), err.error.unwrap_or_default())),
            }
        }
        // Partial success model (§4.4): top-level status is always OK even
        // when individual pairs failed.
        (Response::ok_results(id, results), emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEngine;

    fn processor() -> CommandProcessor {
        CommandProcessor::new(Arc::new(MemoryEngine::new()), "node-a", 300_000, Arc::new(Metrics::default()))
    }

    fn cmd(id: &str, op: Op) -> Command {
        Command { id: id.to_string(), op }
    }

    #[test]
    fn basic_set_get_del() {
        let p = processor();
        let r = p.execute("c1", cmd("r1", Op::Set { key: "user:1".into(), value: "alice".into() }));
        assert_eq!(r.status, crate::command::types::Status::Ok);

        let r = p.execute("c1", cmd("r2", Op::Get { key: "user:1".into() }));
        assert_eq!(r.value.as_deref(), Some("alice"));

        let r = p.execute("c1", cmd("r3", Op::Del { key: "user:1".into() }));
        assert_eq!(r.status, crate::command::types::Status::Ok);

        let r = p.execute("c1", cmd("r4", Op::Get { key: "user:1".into() }));
        assert_eq!(r.error_code, Some(ErrorCode::NotFound));
    }

    #[test]
    fn idempotent_set_mutates_once() {
        let p = processor();
        let r1 = p.execute("c1", cmd("same", Op::Set { key: "x".into(), value: "1".into() }));
        let r2 = p.execute("c1", cmd("same", Op::Set { key: "x".into(), value: "1".into() }));
        assert_eq!(r1.id, r2.id);
        assert_eq!(r1.status, r2.status);
        let get = p.execute("c1", cmd("g", Op::Get { key: "x".into() }));
        assert_eq!(get.value.as_deref(), Some("1"));
    }

    #[test]
    fn bulk_partial_success() {
        let p = processor();
        let pairs = vec![
            ("ok".to_string(), "v1".to_string()),
            ("x".repeat(300), "v2".to_string()),
            ("ok2".to_string(), "v3".to_string()),
        ];
        let r = p.execute("c1", cmd("m1", Op::Mset { key_values: pairs }));
        assert_eq!(r.status, crate::command::types::Status::Ok);
        let results = r.results.unwrap();
        assert_eq!(results[0].status, crate::command::types::Status::Ok);
        assert_eq!(results[1].error_code, Some(ErrorCode::PayloadTooLarge));
        assert_eq!(results[2].status, crate::command::types::Status::Ok);

        let check = p.execute("c1", cmd("g", Op::Get { key: "ok".into() }));
        assert_eq!(check.value.as_deref(), Some("v1"));
    }

    #[test]
    fn idempotency_cache_hits_and_misses_are_counted() {
        let p = processor();
        p.execute("c1", cmd("same", Op::Set { key: "x".into(), value: "1".into() }));
        p.execute("c1", cmd("same", Op::Set { key: "x".into(), value: "1".into() }));
        assert_eq!(p.metrics.idempotency_cache_misses.load(Ordering::Relaxed), 1);
        assert_eq!(p.metrics.idempotency_cache_hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn losing_lww_write_reports_the_stored_value_and_does_not_publish() {
        let store = Arc::new(MemoryEngine::new());
        // A higher-ranked entry already present locally (e.g. pulled in by
        // anti-entropy from a peer whose clock runs ahead). A local INCR
        // against this key cannot win LWW with a `now`-stamped write.
        let winning = StorageEntry::new_set("counter".into(), "100".into(), u64::MAX, "zzz-remote".into(), 1);
        store.apply(winning).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let p = CommandProcessor::new(store.clone(), "node-a", 300_000, Arc::new(Metrics::default())).with_events_channel(tx);

        let r = p.execute("c1", cmd("i1", Op::Incr { key: "counter".into(), amount: Some(5) }));
        assert_eq!(r.status, crate::command::types::Status::Ok);
        assert_eq!(r.value.as_deref(), Some("100"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn decr_by_i64_min_is_invalid_request_not_a_panic() {
        let p = processor();
        let r = p.execute("c1", cmd("d1", Op::Decr { key: "k".into(), amount: Some(i64::MIN) }));
        assert_eq!(r.error_code, Some(ErrorCode::InvalidRequest));
    }

    #[test]
    fn mget_rejects_duplicate_keys() {
        let p = processor();
        let r = p.execute("c1", cmd("m", Op::Mget { keys: vec!["a".into(), "a".into()] }));
        assert_eq!(r.error_code, Some(ErrorCode::InvalidRequest));
    }

    #[test]
    fn incr_decr_on_absent_key_starts_at_zero() {
        let p = processor();
        let r = p.execute("c1", cmd("i1", Op::Incr { key: "counter".into(), amount: Some(5) }));
        assert_eq!(r.value.as_deref(), Some("5"));
        let r = p.execute("c1", cmd("i2", Op::Decr { key: "counter".into(), amount: Some(2) }));
        assert_eq!(r.value.as_deref(), Some("3"));
    }

    #[test]
    fn incr_on_non_numeric_value_is_invalid_request() {
        let p = processor();
        p.execute("c1", cmd("s1", Op::Set { key: "k".into(), value: "not-a-number".into() }));
        let r = p.execute("c1", cmd("i1", Op::Incr { key: "k".into(), amount: None }));
        assert_eq!(r.error_code, Some(ErrorCode::InvalidRequest));
    }

    #[test]
    fn append_prepend_treat_absent_as_empty() {
        let p = processor();
        let r = p.execute("c1", cmd("a1", Op::Append { key: "greeting".into(), value: "Hello".into() }));
        assert_eq!(r.value.as_deref(), Some("5"));
        let r = p.execute("c1", cmd("a2", Op::Prepend { key: "greeting".into(), value: ">> ".into() }));
        assert_eq!(r.value.as_deref(), Some("8"));
        let r = p.execute("c1", cmd("g", Op::Get { key: "greeting".into() }));
        assert_eq!(r.value.as_deref(), Some(">> Hello"));
    }
}
