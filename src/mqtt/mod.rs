//! # MQTT Session
//!
//! Wraps `rumqttc` (already in the teacher's dependency stack) into the
//! connection-state machine, reconnect policy, and topic-routed inbound
//! dispatch described in §4.2. Generalized from the teacher's
//! `Replicator::new` (which embedded a single MQTT connection directly in
//! the replication module) into a standalone session that both the
//! command plane and the replication subscriber attach to.

pub mod session;

pub use session::{ConnectionEvent, ConnectionState, InboundFrame, MqttSession};
