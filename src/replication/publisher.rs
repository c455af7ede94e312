//! Drains the command processor's outbound [`ChangeEvent`] channel and
//! publishes each one, canonically CBOR-encoded, to the replication topic.

use std::sync::Arc;

use log::warn;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::model::ChangeEvent;
use crate::mqtt::MqttSession;
use crate::metrics::{inc, Metrics};

pub struct ReplicationPublisher {
    session: Arc<MqttSession>,
    events_rx: UnboundedReceiver<ChangeEvent>,
    metrics: Arc<Metrics>,
}

impl ReplicationPublisher {
    pub fn new(session: Arc<MqttSession>, events_rx: UnboundedReceiver<ChangeEvent>, metrics: Arc<Metrics>) -> Self {
        Self { session, events_rx, metrics }
    }

    /// Run until the channel closes (i.e. the owning [`crate::client::MerkleKvClient`]
    /// is dropped). A single publish failure is logged and skipped rather
    /// than ending the loop — the event is gone, but anti-entropy will
    /// reconcile the gap on the next round.
    pub async fn run(mut self) {
        while let Some(event) = self.events_rx.recv().await {
            let bytes = match event.to_canonical_cbor() {
                Ok(b) => b,
                Err(e) => {
                    warn!("failed to encode change event for {}: {e}", event.key);
                    continue;
                }
            };
            match self.session.publish_replication(bytes).await {
                Ok(()) => inc!(self.metrics.replication_published),
                Err(e) => warn!("failed to publish change event for {}: {e}", event.key),
            };
        }
    }
}
