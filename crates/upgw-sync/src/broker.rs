//! # Broker Boundary
//!
//! The publish/subscribe seam used by the session, and its MQTT
//! implementation on top of `rumqttc`.
//!
//! ## Link Anatomy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                             BrokerLink                                  │
//! │                                                                         │
//! │   client: Arc<dyn BrokerClient>        events: mpsc::Receiver           │
//! │   ├── publish(topic, payload)          ├── Message { topic, payload }   │
//! │   ├── subscribe(topic)                 └── Disconnected(reason)         │
//! │   └── disconnect()                         (last event of the link)     │
//! │                                                                         │
//! │   One link per connection. The session throws the link away on loss   │
//! │   and asks the connector for a fresh one.                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, MqttOptions, Packet, QoS, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BrokerSettings;
use crate::identity::Credentials;

/// Capacity of the per-link event channel.
const EVENT_BUFFER: usize = 256;

/// Largest shadow document accepted or sent.
const MAX_PACKET_SIZE: usize = 256 * 1024;

// =============================================================================
// Seam
// =============================================================================

/// Classified broker failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The broker refused the presented credentials.
    #[error("broker rejected credentials: {0}")]
    Rejected(String),

    /// Network, TLS or handshake failure.
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// The link is no longer usable.
    #[error("connection closed")]
    Closed,
}

/// Inbound event on a link.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Message { topic: String, payload: Vec<u8> },
    Disconnected(String),
}

/// Outbound half of one broker connection.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn disconnect(&self);
}

/// A live connection: the client plus its event stream.
pub struct BrokerLink {
    pub client: Arc<dyn BrokerClient>,
    pub events: mpsc::Receiver<BrokerEvent>,
}

/// Opens broker connections.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> Result<BrokerLink, TransportError>;
}

// =============================================================================
// MQTT Implementation
// =============================================================================

/// Connects to the shadow broker over MQTT/TLS.
///
/// The access token is presented as the MQTT password.
pub struct MqttConnector {
    settings: BrokerSettings,
}

impl MqttConnector {
    pub fn new(settings: BrokerSettings) -> Self {
        Self { settings }
    }

    fn options(&self, credentials: &Credentials) -> MqttOptions {
        let client_id = format!("{}-{}", self.settings.client_name, Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, &self.settings.endpoint, self.settings.port);
        options.set_keep_alive(Duration::from_secs(self.settings.keep_alive_secs));
        // Subscriptions are restored by the session after every reconnect
        options.set_clean_session(true);
        options.set_credentials(&self.settings.client_name, &credentials.access_token);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        options.set_transport(Transport::tls_with_default_config());
        options
    }
}

/// Maps an event loop error to a [`TransportError`].
fn classify(err: ConnectionError) -> TransportError {
    match err {
        ConnectionError::ConnectionRefused(
            code @ (ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized),
        ) => TransportError::Rejected(format!("{code:?}")),
        other => TransportError::Unreachable(other.to_string()),
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<BrokerLink, TransportError> {
        let (client, mut eventloop) = AsyncClient::new(self.options(credentials), EVENT_BUFFER);

        debug!(endpoint = %self.settings.endpoint, "Connecting to broker");

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        return match ack.code {
                            ConnectReturnCode::Success => Ok(()),
                            code => Err(classify(ConnectionError::ConnectionRefused(code))),
                        };
                    }
                    Ok(_) => {}
                    Err(e) => return Err(classify(e)),
                }
            }
        };

        match tokio::time::timeout(self.settings.connect_timeout(), handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(TransportError::Unreachable(format!(
                    "no CONNACK within {:?}",
                    self.settings.connect_timeout()
                )))
            }
        }

        info!(endpoint = %self.settings.endpoint, "Connected to broker");

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let shutdown = CancellationToken::new();
        let pump_shutdown = shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_shutdown.cancelled() => break,
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let message = BrokerEvent::Message {
                                topic: publish.topic.clone(),
                                payload: publish.payload.to_vec(),
                            };
                            if events_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Ok(Event::Incoming(Packet::SubAck(_))) => {
                            debug!("Subscription acknowledged");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "Broker event loop ended");
                            let _ = events_tx.send(BrokerEvent::Disconnected(e.to_string())).await;
                            break;
                        }
                    },
                }
            }
            debug!("Broker pump stopped");
        });

        Ok(BrokerLink {
            client: Arc::new(MqttBrokerClient { client, shutdown }),
            events: events_rx,
        })
    }
}

struct MqttBrokerClient {
    client: AsyncClient,
    shutdown: CancellationToken,
}

#[async_trait]
impl BrokerClient for MqttBrokerClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn disconnect(&self) {
        let _ = self.client.disconnect().await;
        self.shutdown.cancel();
    }
}

impl Drop for MqttBrokerClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
