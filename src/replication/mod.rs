//! # Replication
//!
//! Every accepted mutation is projected to a [`crate::model::ChangeEvent`]
//! and published on the shared replication topic (§4.3); every device
//! (including the publisher itself, since QoS 1 delivers back to its own
//! subscription) applies every event it sees under LWW. Split into a
//! [`publisher::ReplicationPublisher`] (drains the command processor's
//! outbound channel) and a [`subscriber::ReplicationSubscriber`] (applies
//! inbound frames), mirroring the teacher's `Replicator` but with the single
//! monolithic struct split along its two independent responsibilities.

pub mod publisher;
pub mod subscriber;

pub use publisher::ReplicationPublisher;
pub use subscriber::ReplicationSubscriber;
