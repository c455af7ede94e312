//! # Command Processing
//!
//! - **`types`**: the JSON `Command`/`Response`/`Op` wire schema (§3/§4.1).
//! - **`idempotency`**: `(client_id, request_id)`-keyed LRU+TTL cache so a
//!   retried command is answered from cache instead of re-applied.
//! - **`processor`**: [`processor::CommandProcessor`] — validation, limits,
//!   bulk semantics, `seq` assignment, dispatch to storage and replication.

pub mod idempotency;
pub mod processor;
pub mod types;

pub use idempotency::IdempotencyCache;
pub use processor::CommandProcessor;
pub use types::{Command, Op, Response, Status};
