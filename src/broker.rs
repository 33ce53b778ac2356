//! ==============================================================================
//! broker.rs - pub/sub session abstraction over mqtt
//! ==============================================================================
//!
//! purpose:
//!     keeps the controller and backend free of any mqtt client specifics.
//!     nodes only see three seams:
//!
//!     - MessageHandler: on_message(topic, payload), called for every inbound
//!       publish on a subscribed topic
//!     - Publisher: publish(topic, payload)
//!     - Session: subscribe + a run loop that feeds a handler until cancelled
//!
//! implementations:
//!     - MqttSession: rumqttc client + event loop. connect() waits for the
//!       CONNACK with bounded retry. run() re-subscribes after every reconnect.
//!     - LocalSession: in-memory topic bus, used by tests and for running
//!       both nodes inside one process.
//!
//! lifecycle:
//!
//!     CONNECTING --connack--> CONNECTED --cancel--> DISCONNECTED
//!         |  ^                   |
//!         |  +----- backoff -----+  (connection error, event loop retries)
//!         +-- refused / attempts exhausted --> fatal
//!
//! ==============================================================================

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::SprinklerConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection failed after {attempts} attempt(s): {reason}")]
    Connect { attempts: u32, reason: String },
    #[error("broker refused the connection: {0}")]
    Refused(String),
    #[error("publish to `{topic}` failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("subscribe to `{topic}` failed: {reason}")]
    Subscribe { topic: String, reason: String },
}

/// receives every message delivered on a subscribed topic
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, topic: &str, payload: &[u8]);
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;
}

/// an established broker connection
#[async_trait]
pub trait Session: Send + Sized + 'static {
    fn publisher(&self) -> Arc<dyn Publisher>;

    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    /// Deliver inbound messages to `handler` until `cancel` fires.
    async fn run(
        self,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError>;
}

/// Publish with bounded attempts. Every publish error counts as transient.
pub async fn publish_with_retry(
    publisher: &dyn Publisher,
    topic: &str,
    payload: &[u8],
    policy: RetryPolicy,
) -> Result<(), BrokerError> {
    policy
        .run(topic, |_| publisher.publish(topic, payload.to_vec()), |_| true)
        .await
}

// ==============================================================================
// mqtt session (rumqttc)
// ==============================================================================

#[derive(Debug, Clone)]
pub struct SessionParams {
    /// must be unique per connected client
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub keep_alive: Duration,
    /// initial connect attempts, also the reconnect backoff curve
    pub retry: RetryPolicy,
    /// bounded queue between the client handle and the event loop
    pub request_capacity: usize,
}

impl SessionParams {
    pub fn from_config(config: &SprinklerConfig) -> Self {
        Self {
            client_id: config.client_id(),
            host: config.broker.host.clone(),
            port: config.broker.port,
            username: config.broker.username.clone(),
            password: config.broker.password.clone(),
            keep_alive: Duration::from_secs(config.broker.keep_alive_seconds),
            retry: config.broker.connect_retry(),
            request_capacity: 10,
        }
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        if !self.username.is_empty() {
            options.set_credentials(self.username.clone(), self.password.clone());
        }
        options
    }
}

pub struct MqttSession {
    client: AsyncClient,
    event_loop: EventLoop,
    topics: Vec<String>,
    reconnect: RetryPolicy,
    client_id: String,
}

impl MqttSession {
    /// Open the session and wait for the broker's CONNACK.
    ///
    /// Transport errors are retried per `params.retry`; a refused CONNACK
    /// (bad credentials, duplicate id rejected, ...) fails immediately.
    pub async fn connect(params: SessionParams) -> Result<Self, BrokerError> {
        let (client, mut event_loop) =
            AsyncClient::new(params.mqtt_options(), params.request_capacity.max(1));

        tracing::info!(
            client_id = %params.client_id,
            broker = %format!("{}:{}", params.host, params.port),
            "connecting to broker"
        );

        let mut attempt = 1;
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    tracing::info!(client_id = %params.client_id, attempt, "connected to broker");
                    break;
                }
                Ok(_) => {}
                Err(ConnectionError::ConnectionRefused(code)) => {
                    return Err(BrokerError::Refused(format!("{:?}", code)));
                }
                Err(e) if attempt < params.retry.attempts => {
                    let wait = params.retry.backoff_for(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = params.retry.attempts,
                        backoff_ms = wait.as_millis() as u64,
                        error = %e,
                        "broker connection failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(BrokerError::Connect {
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(Self {
            client,
            event_loop,
            topics: Vec::new(),
            reconnect: params.retry,
            client_id: params.client_id,
        })
    }

    // try_subscribe never waits on the request queue, so it is safe to call
    // from inside the loop that drains it
    fn resubscribe(&self) {
        for topic in &self.topics {
            if let Err(e) = self.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                tracing::error!(%topic, error = %e, "re-subscribe failed");
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.client.try_disconnect().is_err() {
            return;
        }
        // drive the loop until DISCONNECT is on the wire
        let flushed = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match self.event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            tracing::debug!(client_id = %self.client_id, "disconnect not acknowledged in time");
        }
    }
}

#[async_trait]
impl Session for MqttSession {
    fn publisher(&self) -> Arc<dyn Publisher> {
        Arc::new(MqttPublisher {
            client: self.client.clone(),
        })
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| BrokerError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        self.topics.push(topic.to_string());
        tracing::info!(%topic, "subscribed");
        Ok(())
    }

    async fn run(
        mut self,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        let mut failures = 0;
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.event_loop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    handler.on_message(&publish.topic, &publish.payload).await;
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    tracing::info!(client_id = %self.client_id, "reconnected to broker");
                    failures = 0;
                    self.resubscribe();
                }
                Ok(_) => {}
                Err(ConnectionError::ConnectionRefused(code)) => {
                    return Err(BrokerError::Refused(format!("{:?}", code)));
                }
                Err(e) => {
                    failures += 1;
                    let wait = self.reconnect.backoff_for(failures);
                    tracing::warn!(
                        client_id = %self.client_id,
                        failures,
                        backoff_ms = wait.as_millis() as u64,
                        error = %e,
                        "broker connection lost"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }

        self.disconnect().await;
        tracing::info!(client_id = %self.client_id, "broker session closed");
        Ok(())
    }
}

/// cloneable publish handle onto an MqttSession
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BrokerError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

// ==============================================================================
// in-memory bus
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Topic-addressed fan-out inside one process. Like a real broker, a publish
/// with no subscribers succeeds and the message is discarded.
#[derive(Debug, Default)]
pub struct LocalBroker {
    topics: RwLock<HashMap<String, broadcast::Sender<BrokerMessage>>>,
}

impl LocalBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BrokerMessage> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<BrokerMessage> {
        self.sender_for(topic).subscribe()
    }

    pub fn session(self: &Arc<Self>) -> LocalSession {
        LocalSession {
            broker: self.clone(),
            receivers: Vec::new(),
        }
    }
}

#[async_trait]
impl Publisher for LocalBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let message = BrokerMessage {
            topic: topic.to_string(),
            payload: Bytes::from(payload),
        };
        if self.sender_for(topic).send(message).is_err() {
            tracing::trace!(%topic, "no subscribers, message discarded");
        }
        Ok(())
    }
}

pub struct LocalSession {
    broker: Arc<LocalBroker>,
    receivers: Vec<broadcast::Receiver<BrokerMessage>>,
}

#[async_trait]
impl Session for LocalSession {
    fn publisher(&self) -> Arc<dyn Publisher> {
        self.broker.clone()
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.receivers.push(self.broker.subscribe(topic));
        Ok(())
    }

    async fn run(
        self,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        let (tx, mut merged) = mpsc::channel::<BrokerMessage>(64);

        for mut rx in self.receivers {
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let received = tokio::select! {
                        _ = cancel.cancelled() => break,
                        received = rx.recv() => received,
                    };
                    match received {
                        Ok(message) => {
                            if tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "local subscriber lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }
        drop(tx);

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = merged.recv() => message,
            };
            match message {
                Some(message) => handler.on_message(&message.topic, &message.payload).await,
                None => break,
            }
        }
        Ok(())
    }
}
