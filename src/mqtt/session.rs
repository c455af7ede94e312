//! MQTT connection lifecycle: connect, reconnect-with-backoff, QoS 1
//! publish/subscribe, and inbound dispatch by topic (§4.2).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use tokio::sync::{mpsc, watch};

use crate::config::Config;
use crate::error::Result;

/// §4.2's connection state machine. Initial state is `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    ConnectionLost,
}

/// A state paired with a generation counter that increments on every
/// successful (re)connect, so a watcher can tell "the same Connected" from
/// "a new Connected after a reconnect" without missing the transition in
/// between (supplemented over the distilled spec, §2 in SPEC_FULL.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub state: ConnectionState,
    pub generation: u64,
}

/// A frame dispatched to the owner by topic, per §4.2: "Inbound frames
/// dispatched by topic to either the Command Processor or the Replication
/// applicator."
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Command(Vec<u8>),
    Replication(Vec<u8>),
}

/// Exponential backoff with jitter, base 1s, cap 60s, reset on connect.
struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, attempt: 0 }
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_delay(&mut self) -> Duration {
        let shift = self.attempt.min(10);
        let exp_ms = self.base.as_millis().saturating_mul(1u128 << shift);
        let capped_ms = exp_ms.min(self.cap.as_millis()).max(1) as u64;
        self.attempt = self.attempt.saturating_add(1);
        let jittered_ms = rand::thread_rng().gen_range(0..=capped_ms);
        Duration::from_millis(jittered_ms)
    }
}

/// A live MQTT session: publish/subscribe handle plus the background
/// reconnect loop. Shared via `Arc` by every component that needs to
/// publish (command responses, replication events, anti-entropy rounds).
pub struct MqttSession {
    client: AsyncClient,
    command_topic: String,
    response_topic: String,
    replication_topic: String,
    shutdown_tx: watch::Sender<bool>,
    shut_down: AtomicBool,
}

impl MqttSession {
    /// Open a session and spawn its reconnect loop. Returns the session
    /// handle, a connection-state watch, and the inbound-frame channel.
    pub fn start(config: &Config) -> (Arc<MqttSession>, watch::Receiver<ConnectionEvent>, mpsc::UnboundedReceiver<InboundFrame>) {
        let mut opts = MqttOptions::new(config.client_id.clone(), config.broker_host.clone(), config.broker_port());
        opts.set_keep_alive(config.keep_alive());
        opts.set_connection_timeout(config.connect_timeout_s);
        // Persistent session semantics (§4.2): never start clean.
        opts.set_clean_session(false);
        if let (Some(user), Some(pass)) = (&config.broker_username, &config.broker_password) {
            opts.set_credentials(user, pass);
        }
        if config.use_tls {
            opts.set_transport(Transport::tls_with_default_config());
        }

        let (client, mut eventloop) = AsyncClient::new(opts, 64);

        let (state_tx, state_rx) = watch::channel(ConnectionEvent { state: ConnectionState::Disconnected, generation: 0 });
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();

        let session = Arc::new(MqttSession {
            client: client.clone(),
            command_topic: config.command_topic(),
            response_topic: config.response_topic(),
            replication_topic: config.replication_topic(),
            shutdown_tx,
            shut_down: AtomicBool::new(false),
        });

        let command_topic = session.command_topic.clone();
        let replication_topic = session.replication_topic.clone();

        tokio::spawn(async move {
            let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
            let mut generation: u64 = 0;
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        generation += 1;
                        backoff.reset();
                        info!("mqtt connected (session_present={})", ack.session_present);
                        let _ = state_tx.send(ConnectionEvent { state: ConnectionState::Connected, generation });
                        if let Err(e) = client.subscribe(&command_topic, QoS::AtLeastOnce).await {
                            error!("failed to subscribe to command topic: {e}");
                        }
                        if let Err(e) = client.subscribe(&replication_topic, QoS::AtLeastOnce).await {
                            error!("failed to subscribe to replication topic: {e}");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let frame = if publish.topic == command_topic {
                            Some(InboundFrame::Command(publish.payload.to_vec()))
                        } else if publish.topic == replication_topic {
                            Some(InboundFrame::Replication(publish.payload.to_vec()))
                        } else {
                            warn!("dropping publish on unrecognized topic {}", publish.topic);
                            None
                        };
                        if let Some(frame) = frame {
                            if frame_tx.send(frame).is_err() {
                                debug!("inbound frame channel closed, dropping frame");
                            }
                        }
                    }
                    Ok(_other) => {}
                    Err(e) => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        warn!("mqtt eventloop error: {e}");
                        let _ = state_tx.send(ConnectionEvent { state: ConnectionState::ConnectionLost, generation });
                        let delay = backoff.next_delay();
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown_rx.changed() => { if *shutdown_rx.borrow() { break; } }
                        }
                        let _ = state_tx.send(ConnectionEvent { state: ConnectionState::Connecting, generation });
                    }
                }
            }
            let _ = state_tx.send(ConnectionEvent { state: ConnectionState::Disconnecting, generation });
        });

        (session, state_rx, frame_rx)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client.publish(topic, QoS::AtLeastOnce, false, payload).await?;
        Ok(())
    }

    /// Publish a [`crate::command::types::Response`] (or an anti-entropy
    /// reply) on this device's own response topic.
    pub async fn publish_response(&self, payload: Vec<u8>) -> Result<()> {
        self.publish(&self.response_topic, payload).await
    }

    /// Publish a canonical-CBOR [`crate::model::ChangeEvent`] on the shared
    /// replication topic.
    pub async fn publish_replication(&self, payload: Vec<u8>) -> Result<()> {
        self.publish(&self.replication_topic, payload).await
    }

    /// Publish an anti-entropy request/response envelope to a peer's
    /// command topic (anti-entropy reuses the command-plane topic rather
    /// than minting a fourth topic class; see DESIGN.md).
    pub async fn publish_to_topic(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.publish(topic, payload).await
    }

    /// Explicit shutdown: only this exits the reconnect loop (§4.2).
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let _ = self.client.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_within_base_and_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_secs(60));
        }
    }

    #[test]
    fn backoff_resets_attempt_counter() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(1));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt, 0);
    }
}
