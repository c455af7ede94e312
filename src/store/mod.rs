//! # Storage Engine Module
//!
//! - **`engine`**: common [`StorageEngine`] interface, built around
//!   [`crate::model::StorageEntry`] rather than raw strings so LWW and
//!   tombstone handling live in one place.
//! - **`memory`**: thread-safe in-memory engine (`RwLock<HashMap>`).
//! - **`persistent`**: sled-backed append-only log with an in-memory index,
//!   replayed on open.
//! - **`factory`**: picks a backend from [`crate::config::Config`].

pub mod engine;
pub mod factory;
pub mod memory;
pub mod persistent;

pub use engine::StorageEngine;
pub use factory::create_engine;
pub use memory::MemoryEngine;
pub use persistent::PersistentEngine;
