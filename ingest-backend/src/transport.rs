//! Pub/sub transport (§4.1, §6). The router never depends on a concrete
//! MQTT client — everything goes through this object-safe `Transport`
//! trait. The shipped implementation wraps `rumqttc`; its connection loop
//! follows the bind/connect-once, loop-on-receive shape: never let a
//! transport error crash the task, and log a dedicated line per lifecycle
//! transition.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::backoff::Backoff;
use crate::config::AppConfig;
use crate::error::TransportError;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// `rumqttc`-backed transport. `start` spawns the event loop as a
/// background task and returns a client handle plus a channel of inbound
/// messages for the router to drain — the router polls that channel
/// instead of touching `rumqttc` directly, so it only ever depends on
/// `Transport` + this receiver.
pub struct RumqttcTransport {
    client: AsyncClient,
}

impl RumqttcTransport {
    pub fn start(cfg: &AppConfig) -> (Self, mpsc::Receiver<InboundMessage>) {
        let mut options = MqttOptions::new(
            format!("ingest-backend-{}", uuid::Uuid::new_v4()),
            cfg.mqtt_host.clone(),
            cfg.mqtt_port,
        );
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&cfg.mqtt_username, &cfg.mqtt_password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 256);
        let (tx, rx) = mpsc::channel(1024);

        let subscriptions = vec![
            cfg.topic_pattern_data.clone(),
            cfg.topic_pattern_status.clone(),
            cfg.topic_pattern_ack.clone(),
        ];
        let sub_client = client.clone();

        tokio::spawn(async move {
            let mut backoff = Backoff::default();
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        // §7: a transport reconnect must restart subscriptions —
                        // with the default clean session the broker drops them
                        // on every reconnect, so this fires on first connect and
                        // again after every `Err` branch below reconnects us.
                        backoff.reset();
                        for topic in &subscriptions {
                            if let Err(e) = sub_client.subscribe(topic, QoS::AtMostOnce).await {
                                warn!("transport: failed to subscribe to {topic}: {e}");
                            }
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        backoff.reset();
                        let msg = InboundMessage {
                            topic: p.topic.clone(),
                            payload: p.payload.to_vec(),
                        };
                        if tx.send(msg).await.is_err() {
                            info!("transport: inbound channel closed, stopping event loop");
                            return;
                        }
                    }
                    Ok(Event::Incoming(Incoming::Disconnect)) => {
                        info!("transport: broker requested disconnect");
                    }
                    Ok(_) => {
                        backoff.reset();
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!("transport: event loop error: {e}, reconnecting in {delay:?}");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        });

        (Self { client }, rx)
    }
}

#[async_trait]
impl Transport for RumqttcTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| TransportError::Internal(e.into()))
    }
}

/// In-process transport for integration tests: `publish` records what was
/// sent, and inbound messages are injected directly instead of flowing
/// through a real broker.
#[derive(Clone)]
pub struct InMemoryTransport {
    pub outbound: std::sync::Arc<tokio::sync::Mutex<Vec<InboundMessage>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            outbound: std::sync::Arc::new(tokio::sync::Mutex::new(Vec::new())),
        }
    }

    pub async fn sent(&self) -> Vec<InboundMessage> {
        self.outbound.lock().await.clone()
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.outbound.lock().await.push(InboundMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }
}
