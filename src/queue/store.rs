//! # Offline Queue Backing Store
//!
//! [`QueueStore`] is a small capability trait (§9: "model dynamic interfaces
//! as small capability sets with concrete variants") with two
//! implementations: [`SqliteQueueStore`], the durable default grounded on
//! the pack's `c2-router/src/offline.rs` (an embedded-SQLite durable
//! queue), and [`InMemoryQueueStore`], a test double that never touches
//! disk. Both honor the ordering contract of §4.7: [`QueueStore::get_all_operations`]
//! returns rows ordered by `priority DESC, queued_at ASC`.

use std::sync::Mutex;

use rusqlite::{params, Connection};

use crate::error::{MkvError, Result};
use crate::queue::types::{Priority, QueuedOperation};

/// Swappable durable backing store for [`crate::queue::processor::OfflineQueue`].
pub trait QueueStore: Send + Sync {
    fn store_operation(&self, op: &QueuedOperation) -> Result<()>;
    fn update_operation(&self, op: &QueuedOperation) -> Result<()>;
    /// All operations ordered by `priority DESC, queued_at_ms ASC` — the
    /// exact drain order §4.7 specifies.
    fn get_all_operations(&self) -> Result<Vec<QueuedOperation>>;
    fn remove_operation(&self, operation_id: &str) -> Result<()>;
    fn remove_operations(&self, operation_ids: &[String]) -> Result<()>;
    /// Remove operations older than `max_age_ms` as of `now_ms`; returns how
    /// many were removed.
    fn remove_expired(&self, now_ms: u64, max_age_ms: u64) -> Result<usize>;
    /// Evict the oldest `n` operations of `priority`; returns how many were
    /// actually evicted (fewer than `n` if the priority bucket is smaller).
    fn evict_oldest(&self, priority: Priority, n: usize) -> Result<usize>;
    fn count(&self, priority: Priority) -> Result<usize>;
    fn clear_all(&self) -> Result<()>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS queued_operations (
    operation_id TEXT PRIMARY KEY,
    operation_type TEXT NOT NULL,
    priority INTEGER NOT NULL,
    command_data BLOB NOT NULL,
    queued_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL,
    last_error TEXT
);
CREATE INDEX IF NOT EXISTS idx_queue_priority_queued_at ON queued_operations (priority DESC, queued_at ASC);
CREATE INDEX IF NOT EXISTS idx_queue_queued_at ON queued_operations (queued_at ASC);
";

/// Embedded-relational (SQLite, via `rusqlite`) durable queue store (§6's
/// "Persistence layout"). A single connection behind a mutex: §5 specifies
/// single-writer transactions for the backing store, and `rusqlite`'s
/// `Connection` is `!Sync` besides.
pub struct SqliteQueueStore {
    conn: Mutex<Connection>,
}

impl SqliteQueueStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn row_to_operation(row: &rusqlite::Row) -> rusqlite::Result<QueuedOperation> {
        let priority_int: i64 = row.get(2)?;
        let priority = Priority::from_i64(priority_int).unwrap_or(Priority::Normal);
        Ok(QueuedOperation {
            operation_id: row.get(0)?,
            operation_type: row.get(1)?,
            priority,
            command_bytes: row.get(3)?,
            queued_at_ms: row.get::<_, i64>(4)? as u64,
            attempts: row.get::<_, i64>(5)? as u32,
            last_error: row.get(6)?,
        })
    }
}

impl QueueStore for SqliteQueueStore {
    fn store_operation(&self, op: &QueuedOperation) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO queued_operations
             (operation_id, operation_type, priority, command_data, queued_at, attempts, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                op.operation_id,
                op.operation_type,
                op.priority.as_i64(),
                op.command_bytes,
                op.queued_at_ms as i64,
                op.attempts as i64,
                op.last_error,
            ],
        )?;
        Ok(())
    }

    fn update_operation(&self, op: &QueuedOperation) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE queued_operations SET attempts = ?1, last_error = ?2 WHERE operation_id = ?3",
            params![op.attempts as i64, op.last_error, op.operation_id],
        )?;
        Ok(())
    }

    fn get_all_operations(&self) -> Result<Vec<QueuedOperation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT operation_id, operation_type, priority, command_data, queued_at, attempts, last_error
             FROM queued_operations ORDER BY priority DESC, queued_at ASC",
        )?;
        let rows = stmt.query_map([], Self::row_to_operation)?;
        let mut ops = Vec::new();
        for row in rows {
            ops.push(row?);
        }
        Ok(ops)
    }

    fn remove_operation(&self, operation_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM queued_operations WHERE operation_id = ?1", params![operation_id])?;
        Ok(())
    }

    fn remove_operations(&self, operation_ids: &[String]) -> Result<()> {
        if operation_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for id in operation_ids {
            tx.execute("DELETE FROM queued_operations WHERE operation_id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn remove_expired(&self, now_ms: u64, max_age_ms: u64) -> Result<usize> {
        let cutoff = now_ms.saturating_sub(max_age_ms) as i64;
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute("DELETE FROM queued_operations WHERE queued_at < ?1", params![cutoff])?;
        Ok(removed)
    }

    fn evict_oldest(&self, priority: Priority, n: usize) -> Result<usize> {
        if n == 0 {
            return Ok(0);
        }
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM queued_operations WHERE operation_id IN (
                SELECT operation_id FROM queued_operations WHERE priority = ?1
                ORDER BY queued_at ASC LIMIT ?2
             )",
            params![priority.as_i64(), n as i64],
        )?;
        Ok(removed)
    }

    fn count(&self, priority: Priority) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queued_operations WHERE priority = ?1",
            params![priority.as_i64()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn clear_all(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM queued_operations", [])?;
        Ok(())
    }
}

/// Non-durable test double: a `Vec` behind a mutex, sorted on every read.
/// Used by unit tests that want `QueueStore` semantics without a SQLite
/// fixture.
#[derive(Default)]
pub struct InMemoryQueueStore {
    ops: Mutex<Vec<QueuedOperation>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for InMemoryQueueStore {
    fn store_operation(&self, op: &QueuedOperation) -> Result<()> {
        self.ops.lock().unwrap().push(op.clone());
        Ok(())
    }

    fn update_operation(&self, op: &QueuedOperation) -> Result<()> {
        let mut ops = self.ops.lock().unwrap();
        if let Some(existing) = ops.iter_mut().find(|o| o.operation_id == op.operation_id) {
            existing.attempts = op.attempts;
            existing.last_error = op.last_error.clone();
            Ok(())
        } else {
            Err(MkvError::queue_storage(format!("no such operation {}", op.operation_id)))
        }
    }

    fn get_all_operations(&self) -> Result<Vec<QueuedOperation>> {
        let mut ops = self.ops.lock().unwrap().clone();
        ops.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.queued_at_ms.cmp(&b.queued_at_ms)));
        Ok(ops)
    }

    fn remove_operation(&self, operation_id: &str) -> Result<()> {
        self.ops.lock().unwrap().retain(|o| o.operation_id != operation_id);
        Ok(())
    }

    fn remove_operations(&self, operation_ids: &[String]) -> Result<()> {
        let ids: std::collections::HashSet<&String> = operation_ids.iter().collect();
        self.ops.lock().unwrap().retain(|o| !ids.contains(&o.operation_id));
        Ok(())
    }

    fn remove_expired(&self, now_ms: u64, max_age_ms: u64) -> Result<usize> {
        let cutoff = now_ms.saturating_sub(max_age_ms);
        let mut ops = self.ops.lock().unwrap();
        let before = ops.len();
        ops.retain(|o| o.queued_at_ms >= cutoff);
        Ok(before - ops.len())
    }

    fn evict_oldest(&self, priority: Priority, n: usize) -> Result<usize> {
        let mut ops = self.ops.lock().unwrap();
        let mut candidates: Vec<usize> = ops
            .iter()
            .enumerate()
            .filter(|(_, o)| o.priority == priority)
            .map(|(i, _)| i)
            .collect();
        candidates.sort_by_key(|&i| ops[i].queued_at_ms);
        let to_remove: std::collections::HashSet<usize> = candidates.into_iter().take(n).collect();
        let removed = to_remove.len();
        let mut idx = 0;
        ops.retain(|_| {
            let keep = !to_remove.contains(&idx);
            idx += 1;
            keep
        });
        Ok(removed)
    }

    fn count(&self, priority: Priority) -> Result<usize> {
        Ok(self.ops.lock().unwrap().iter().filter(|o| o.priority == priority).count())
    }

    fn clear_all(&self) -> Result<()> {
        self.ops.lock().unwrap().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::types::{Command, Op};

    fn op(priority: Priority, queued_at_ms: u64) -> QueuedOperation {
        let cmd = Command { id: "r".into(), op: Op::Get { key: "k".into() } };
        let mut o = QueuedOperation::new(&cmd, priority, queued_at_ms).unwrap();
        o.operation_id = format!("{}-{}", priority.as_i64(), queued_at_ms);
        o
    }

    fn exercise_ordering(store: &dyn QueueStore) {
        store.store_operation(&op(Priority::Low, 10)).unwrap();
        store.store_operation(&op(Priority::High, 20)).unwrap();
        store.store_operation(&op(Priority::High, 5)).unwrap();
        store.store_operation(&op(Priority::Normal, 15)).unwrap();

        let all = store.get_all_operations().unwrap();
        let ids: Vec<&str> = all.iter().map(|o| o.operation_id.as_str()).collect();
        assert_eq!(ids, vec!["2-5", "2-20", "1-15", "0-10"]);
    }

    #[test]
    fn sqlite_store_orders_by_priority_desc_then_fifo() {
        let store = SqliteQueueStore::open_in_memory().unwrap();
        exercise_ordering(&store);
    }

    #[test]
    fn in_memory_store_orders_by_priority_desc_then_fifo() {
        let store = InMemoryQueueStore::new();
        exercise_ordering(&store);
    }

    #[test]
    fn sqlite_store_evicts_oldest_of_a_priority() {
        let store = SqliteQueueStore::open_in_memory().unwrap();
        store.store_operation(&op(Priority::Low, 10)).unwrap();
        store.store_operation(&op(Priority::Low, 20)).unwrap();
        store.store_operation(&op(Priority::Low, 30)).unwrap();
        let evicted = store.evict_oldest(Priority::Low, 2).unwrap();
        assert_eq!(evicted, 2);
        let remaining = store.get_all_operations().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].operation_id, "0-30");
    }

    #[test]
    fn sqlite_store_removes_expired() {
        let store = SqliteQueueStore::open_in_memory().unwrap();
        store.store_operation(&op(Priority::Normal, 1_000)).unwrap();
        store.store_operation(&op(Priority::Normal, 100_000)).unwrap();
        let removed = store.remove_expired(200_000, 50_000).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.get_all_operations().unwrap().len(), 1);
    }

    #[test]
    fn sqlite_store_update_sets_attempts_and_error() {
        let store = SqliteQueueStore::open_in_memory().unwrap();
        let mut o = op(Priority::Normal, 1);
        store.store_operation(&o).unwrap();
        o.attempts = 2;
        o.last_error = Some("boom".into());
        store.update_operation(&o).unwrap();
        let all = store.get_all_operations().unwrap();
        assert_eq!(all[0].attempts, 2);
        assert_eq!(all[0].last_error.as_deref(), Some("boom"));
    }
}
