//! # Offline Operation Queue
//!
//! Buffers commands issued while the session is not `Connected` (§3,
//! §4.7) and drains them, in priority then FIFO order, once connectivity
//! returns. Generalizes the pack's embedded-SQLite offline buffer (see
//! [`store`]) with priority tiers, capacity eviction, retry bookkeeping,
//! and battery-adaptive batching that the teacher has no counterpart for.

pub mod processor;
pub mod store;
pub mod types;

pub use processor::{CommandExecutor, OfflineQueue};
pub use store::{InMemoryQueueStore, QueueStore, SqliteQueueStore};
pub use types::{Priority, QueueStats, QueuedOperation};
