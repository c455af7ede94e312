//! # Storage Engine Selection
//!
//! Mirrors the teacher's `main.rs` engine switch (`rwlock` / `kv` / `sled`
//! selected by a config string), collapsed to the two backends this crate
//! actually ships: in-memory by default, sled-backed when persistence is
//! requested and a storage path is configured.

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::store::engine::StorageEngine;
use crate::store::memory::MemoryEngine;
use crate::store::persistent::PersistentEngine;

pub fn create_engine(config: &Config) -> Result<Arc<dyn StorageEngine>> {
    if config.persistence_enabled {
        let path = config
            .storage_path
            .as_deref()
            .expect("Config::validate guarantees storage_path when persistence_enabled");
        Ok(Arc::new(PersistentEngine::open(path)?))
    } else {
        Ok(Arc::new(MemoryEngine::new()))
    }
}
