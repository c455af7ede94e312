//! # Configuration & Topic Scheme
//!
//! Loading follows the teacher's `config` crate + TOML pattern
//! (`config::Config::builder().add_source(File::from(path))`); validation is
//! new — the source config was accepted as-is, but a client embedded in a
//! mobile app should fail fast on a malformed `client_id` rather than
//! discover it the first time a topic is built.

use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigLib, File};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{MkvError, Result};

const DEFAULT_KEEP_ALIVE_S: u64 = 60;
const DEFAULT_SESSION_EXPIRY_S: u64 = 86_400;
const DEFAULT_SKEW_MAX_FUTURE_MS: u64 = 300_000;
const DEFAULT_TOMBSTONE_RETENTION_H: u64 = 24;
const DEFAULT_CONNECT_TIMEOUT_S: u64 = 20;
const DEFAULT_TOPIC_PREFIX: &str = "mkv";
const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
const DEFAULT_QUEUE_MAX_AGE_H: u64 = 24 * 7;
const DEFAULT_QUEUE_MAX_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_QUEUE_BATCH_SIZE: usize = 50;

/// Battery-level thresholds and adaptation toggles (§5).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatteryConfig {
    /// Battery percentage at or below which "low battery" behaviors kick in.
    pub low_threshold: u8,
    /// Battery percentage at or below which "critical battery" behaviors kick in.
    pub critical_threshold: u8,
    /// Stretch the MQTT keepalive interval when battery is low.
    pub adaptive_keepalive: bool,
    /// Stretch the anti-entropy interval when battery is low; pause near-critical
    /// unless charging.
    pub adaptive_sync_interval: bool,
    /// Defer Low-priority offline-queue operations when battery is low.
    pub enable_operation_throttling: bool,
    /// Shrink offline-queue batch size / cadence when battery is low.
    pub reduce_background_activity: bool,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            low_threshold: 20,
            critical_threshold: 10,
            adaptive_keepalive: true,
            adaptive_sync_interval: true,
            enable_operation_throttling: true,
            reduce_background_activity: true,
        }
    }
}

/// Immutable, validated configuration for one [`crate::client::MerkleKvClient`].
///
/// Constructed via [`Config::new`] or loaded from TOML via [`Config::load`];
/// both paths run the same [`Config::validate`] so a malformed `client_id`
/// or `node_id` is caught before any topic is built or any connection is
/// attempted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub broker_host: String,
    #[serde(default)]
    pub broker_port: Option<u16>,
    pub use_tls: bool,
    #[serde(skip_serializing, default)]
    pub broker_username: Option<String>,
    #[serde(skip_serializing, default)]
    pub broker_password: Option<String>,
    pub client_id: String,
    pub node_id: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_keep_alive_s")]
    pub keep_alive_s: u64,
    #[serde(default = "default_session_expiry_s")]
    pub session_expiry_s: u64,
    #[serde(default = "default_skew_max_future_ms")]
    pub skew_max_future_ms: u64,
    #[serde(default = "default_tombstone_retention_h")]
    pub tombstone_retention_h: u64,
    #[serde(default = "default_connect_timeout_s")]
    pub connect_timeout_s: u64,
    #[serde(default)]
    pub persistence_enabled: bool,
    #[serde(default)]
    pub storage_path: Option<String>,
    #[serde(default)]
    pub battery_config: BatteryConfig,
    /// Static seed list of peer node ids for anti-entropy, supplementing
    /// whatever peers are learned dynamically from replication traffic.
    /// Addressing convention (§4.6, §9: no discovery protocol beyond the
    /// shared topic prefix): a peer's anti-entropy command topic is built
    /// from this same identifier via [`Config::peer_command_topic`], so a
    /// device's `node_id` must equal its `client_id` for it to be
    /// reachable as an anti-entropy peer, whether seeded here or learned
    /// dynamically from an observed replication `node_id`.
    #[serde(default)]
    pub anti_entropy_peers: Vec<String>,
    #[serde(default = "default_anti_entropy_interval_s")]
    pub anti_entropy_interval_s: u64,
    /// Backing file for the offline operation queue's embedded relational
    /// store (§4.7). `None` keeps the queue in memory only — fine for
    /// tests and short-lived hosts, but a mobile deployment should always
    /// set this so queued operations survive a process restart.
    #[serde(default)]
    pub queue_storage_path: Option<String>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_queue_max_age_h")]
    pub queue_max_age_h: u64,
    #[serde(default = "default_queue_max_retry_attempts")]
    pub queue_max_retry_attempts: u32,
    #[serde(default = "default_queue_batch_size")]
    pub queue_batch_size: usize,
}

fn default_topic_prefix() -> String {
    DEFAULT_TOPIC_PREFIX.to_string()
}
fn default_keep_alive_s() -> u64 {
    DEFAULT_KEEP_ALIVE_S
}
fn default_session_expiry_s() -> u64 {
    DEFAULT_SESSION_EXPIRY_S
}
fn default_skew_max_future_ms() -> u64 {
    DEFAULT_SKEW_MAX_FUTURE_MS
}
fn default_tombstone_retention_h() -> u64 {
    DEFAULT_TOMBSTONE_RETENTION_H
}
fn default_connect_timeout_s() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_S
}
fn default_anti_entropy_interval_s() -> u64 {
    60
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_queue_max_age_h() -> u64 {
    DEFAULT_QUEUE_MAX_AGE_H
}
fn default_queue_max_retry_attempts() -> u32 {
    DEFAULT_QUEUE_MAX_RETRY_ATTEMPTS
}
fn default_queue_batch_size() -> usize {
    DEFAULT_QUEUE_BATCH_SIZE
}

/// Characters forbidden in `client_id`/`node_id`/`topic_prefix` (MQTT
/// wildcards and level separator, plus whitespace).
fn has_forbidden_chars(s: &str) -> bool {
    s.chars().any(|c| c == '/' || c == '+' || c == '#' || c.is_whitespace())
}

impl Config {
    /// Build a config, inferring `broker_port` from `use_tls` when not set
    /// explicitly by the caller (callers go through [`Config::load`] or
    /// construct this struct directly and then call [`Config::validate`]).
    pub fn new(broker_host: impl Into<String>, client_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        let use_tls = false;
        Self {
            broker_host: broker_host.into(),
            broker_port: None,
            use_tls,
            broker_username: None,
            broker_password: None,
            client_id: client_id.into(),
            node_id: node_id.into(),
            topic_prefix: default_topic_prefix(),
            keep_alive_s: default_keep_alive_s(),
            session_expiry_s: default_session_expiry_s(),
            skew_max_future_ms: default_skew_max_future_ms(),
            tombstone_retention_h: default_tombstone_retention_h(),
            connect_timeout_s: default_connect_timeout_s(),
            persistence_enabled: false,
            storage_path: None,
            battery_config: BatteryConfig::default(),
            anti_entropy_peers: Vec::new(),
            anti_entropy_interval_s: default_anti_entropy_interval_s(),
            queue_storage_path: None,
            queue_capacity: default_queue_capacity(),
            queue_max_age_h: default_queue_max_age_h(),
            queue_max_retry_attempts: default_queue_max_retry_attempts(),
            queue_batch_size: default_queue_batch_size(),
        }
    }

    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = ConfigLib::builder()
            .add_source(File::from(path))
            .build()
            .map_err(|e| MkvError::invalid_config(e.to_string()))?;
        let mut config: Config = settings
            .try_deserialize()
            .map_err(|e| MkvError::invalid_config(e.to_string()))?;
        config.normalize_topic_prefix();
        config.validate()?;
        Ok(config)
    }

    fn normalize_topic_prefix(&mut self) {
        let trimmed = self.topic_prefix.trim().trim_matches('/');
        let collapsed = trimmed
            .split('/')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        self.topic_prefix = if collapsed.is_empty() {
            DEFAULT_TOPIC_PREFIX.to_string()
        } else {
            collapsed
        };
    }

    /// Validate identifiers, topic prefix, and persistence requirements.
    ///
    /// Call this after mutating a freshly-constructed `Config`; `load`
    /// already calls it.
    pub fn validate(&self) -> Result<()> {
        Self::validate_identifier("client_id", &self.client_id)?;
        Self::validate_identifier("node_id", &self.node_id)?;
        Self::validate_identifier("topic_prefix", &self.topic_prefix)?;

        if self.persistence_enabled && self.storage_path.is_none() {
            return Err(MkvError::invalid_config(
                "storage_path is required when persistence_enabled is true",
            ));
        }
        if !self.use_tls && (self.broker_username.is_some() || self.broker_password.is_some()) {
            warn!("broker credentials configured without TLS; transport is unencrypted");
        }
        Ok(())
    }

    fn validate_identifier(field: &str, value: &str) -> Result<()> {
        if value.is_empty() || value.len() > 128 {
            return Err(MkvError::invalid_config(format!(
                "{field} must be 1..128 bytes, got {}",
                value.len()
            )));
        }
        if has_forbidden_chars(value) {
            return Err(MkvError::invalid_config(format!(
                "{field} must not contain '/', '+', '#', or whitespace"
            )));
        }
        Ok(())
    }

    /// Effective broker port: the explicit value if set, else 8883/1883
    /// inferred from `use_tls`.
    pub fn broker_port(&self) -> u16 {
        self.broker_port.unwrap_or(if self.use_tls { 8883 } else { 1883 })
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_s)
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_s)
    }
    pub fn tombstone_retention(&self) -> Duration {
        Duration::from_secs(self.tombstone_retention_h * 3600)
    }
    pub fn skew_max_future(&self) -> Duration {
        Duration::from_millis(self.skew_max_future_ms)
    }
    pub fn anti_entropy_interval(&self) -> Duration {
        Duration::from_secs(self.anti_entropy_interval_s)
    }
    pub fn queue_max_age(&self) -> Duration {
        Duration::from_secs(self.queue_max_age_h * 3600)
    }

    /// `<prefix>/<client_id>/cmd` — commands addressed to this device.
    pub fn command_topic(&self) -> String {
        format!("{}/{}/cmd", self.topic_prefix, self.client_id)
    }
    /// `<prefix>/<client_id>/res` — responses emitted by this device.
    pub fn response_topic(&self) -> String {
        format!("{}/{}/res", self.topic_prefix, self.client_id)
    }
    /// `<prefix>/replication/events` — shared replication bus.
    pub fn replication_topic(&self) -> String {
        format!("{}/replication/events", self.topic_prefix)
    }
    /// `<prefix>/<node_id>/cmd` of a peer, used to address anti-entropy
    /// request/response rounds at that peer. Relies on the node_id ==
    /// client_id addressing convention documented on
    /// [`Config::anti_entropy_peers`].
    pub fn peer_command_topic(&self, peer_node_id: &str) -> String {
        format!("{}/{}/cmd", self.topic_prefix, peer_node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_config_passes() {
        let cfg = Config::new("localhost", "device-1", "node-1");
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.command_topic(), "mkv/device-1/cmd");
        assert_eq!(cfg.response_topic(), "mkv/device-1/res");
        assert_eq!(cfg.replication_topic(), "mkv/replication/events");
    }

    #[test]
    fn rejects_wildcard_client_id() {
        let cfg = Config::new("localhost", "device/1", "node-1");
        assert!(cfg.validate().is_err());
        let cfg = Config::new("localhost", "device+1", "node-1");
        assert!(cfg.validate().is_err());
        let cfg = Config::new("localhost", "device 1", "node-1");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_empty_or_oversize_node_id() {
        let cfg = Config::new("localhost", "device-1", "");
        assert!(cfg.validate().is_err());
        let cfg = Config::new("localhost", "device-1", &"n".repeat(129));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn persistence_requires_storage_path() {
        let mut cfg = Config::new("localhost", "device-1", "node-1");
        cfg.persistence_enabled = true;
        assert!(cfg.validate().is_err());
        cfg.storage_path = Some("/tmp/mkv".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn topic_prefix_normalizes() {
        let mut cfg = Config::new("localhost", "device-1", "node-1");
        cfg.topic_prefix = "//mkv//prod//".to_string();
        cfg.normalize_topic_prefix();
        assert_eq!(cfg.topic_prefix, "mkv/prod");
    }

    #[test]
    fn config_serialization_omits_secrets() {
        let mut cfg = Config::new("localhost", "device-1", "node-1");
        cfg.broker_username = Some("user".into());
        cfg.broker_password = Some("hunter2".into());
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("broker_password"));
    }
}
