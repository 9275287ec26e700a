//! MQTT transport to the device fleet.
//!
//! One connection is constructed at process start and handed to every
//! publisher by handle; inbound publishes are forwarded over a channel so
//! the dispatcher processes one message at a time.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_rustls::rustls::ClientConfig;

/// Configuration for the broker connection
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: format!("central-{}", uuid::Uuid::new_v4()),
            username: None,
            password: None,
            use_tls: false,
            keep_alive_secs: 30,
        }
    }
}

impl MqttConfig {
    /// Read the broker settings from the environment, defaulting to a local
    /// unauthenticated broker for development.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            broker_host: std::env::var("MQTT_HOST").unwrap_or(defaults.broker_host),
            broker_port: std::env::var("MQTT_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.broker_port),
            client_id: std::env::var("MQTT_CLIENT_ID").unwrap_or(defaults.client_id),
            username: std::env::var("MQTT_USERNAME").ok(),
            password: std::env::var("MQTT_PASSWORD").ok(),
            use_tls: std::env::var("MQTT_USE_TLS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            keep_alive_secs: defaults.keep_alive_secs,
        }
    }
}

/// Error types for MQTT operations
#[derive(Debug, Clone)]
pub enum MqttError {
    ConnectionFailed(String),
    SubscribeFailed(String),
    PublishFailed(String),
}

impl std::fmt::Display for MqttError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MqttError::ConnectionFailed(msg) => write!(f, "MQTT connection failed: {}", msg),
            MqttError::SubscribeFailed(msg) => write!(f, "MQTT subscribe failed: {}", msg),
            MqttError::PublishFailed(msg) => write!(f, "MQTT publish failed: {}", msg),
        }
    }
}

impl std::error::Error for MqttError {}

/// A message received from the bus
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl MqttMessage {
    /// Try to parse the payload as JSON
    pub fn parse_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Get payload as string
    pub fn payload_str(&self) -> Option<String> {
        String::from_utf8(self.payload.clone()).ok()
    }
}

/// The publish seam. Commands are fire-and-forget; ordering between two
/// publishes from the same task follows the client's send order.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), MqttError>;
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError>;
}

/// A managed connection to the broker
pub struct MqttConnection {
    client: AsyncClient,
    _event_handle: tokio::task::JoinHandle<()>,
}

impl MqttConnection {
    /// Connect and return the handle plus the stream of inbound publishes.
    pub async fn connect(
        config: MqttConfig,
    ) -> Result<(Self, mpsc::Receiver<MqttMessage>), MqttError> {
        let mut mqtt_options =
            MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);

        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        if config.use_tls {
            // Load native root certificates from the operating system
            let mut root_cert_store = tokio_rustls::rustls::RootCertStore::empty();

            let cert_result = rustls_native_certs::load_native_certs();
            for err in &cert_result.errors {
                warn!("Error loading native cert: {}", err);
            }

            let (added, _ignored) = root_cert_store.add_parsable_certificates(cert_result.certs);
            debug!("Loaded {} native root certificates for TLS", added);

            let client_config = ClientConfig::builder()
                .with_root_certificates(root_cert_store)
                .with_no_client_auth();

            mqtt_options.set_transport(Transport::tls_with_config(client_config.into()));
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);
        let (tx, rx) = mpsc::channel(100);

        let event_handle = tokio::spawn(async move {
            Self::run_event_loop(eventloop, tx).await;
        });

        // Wait a bit for connection to establish
        tokio::time::sleep(Duration::from_millis(500)).await;

        info!(
            "MQTT connected to {}:{}",
            config.broker_host, config.broker_port
        );

        Ok((
            Self {
                client,
                _event_handle: event_handle,
            },
            rx,
        ))
    }

    /// Forward every inbound publish to the dispatcher's channel.
    async fn run_event_loop(mut eventloop: EventLoop, tx: mpsc::Sender<MqttMessage>) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let msg = MqttMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    };
                    debug!("MQTT received on {}: {} bytes", msg.topic, msg.payload.len());
                    if tx.send(msg).await.is_err() {
                        // Dispatcher is gone; nothing left to deliver to.
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("MQTT connection acknowledged");
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    debug!("MQTT subscription acknowledged");
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT event loop error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Publish JSON payload
    pub async fn publish_json<T: Serialize>(
        &self,
        topic: &str,
        payload: &T,
    ) -> Result<(), MqttError> {
        let json =
            serde_json::to_vec(payload).map_err(|e| MqttError::PublishFailed(e.to_string()))?;
        MessageBus::publish(self, topic, json).await
    }

    /// Disconnect the client
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| MqttError::ConnectionFailed(e.to_string()))
    }
}

#[async_trait]
impl MessageBus for MqttConnection {
    async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| MqttError::SubscribeFailed(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| MqttError::PublishFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mqtt_config_default() {
        let config = MqttConfig::default();
        assert_eq!(config.broker_host, "localhost");
        assert_eq!(config.broker_port, 1883);
        assert!(!config.use_tls);
        assert!(config.client_id.starts_with("central-"));
    }

    #[test]
    fn test_mqtt_error_display() {
        let err = MqttError::ConnectionFailed("test".to_string());
        assert!(err.to_string().contains("connection failed"));

        let err = MqttError::PublishFailed("boom".to_string());
        assert!(err.to_string().contains("publish failed"));
    }

    #[test]
    fn test_mqtt_message_payload_str() {
        let msg = MqttMessage {
            topic: "test/topic".to_string(),
            payload: b"hello world".to_vec(),
        };
        assert_eq!(msg.payload_str(), Some("hello world".to_string()));
    }

    #[test]
    fn test_mqtt_message_parse_json() {
        #[derive(Deserialize, PartialEq, Debug)]
        struct TestPayload {
            value: i32,
        }

        let msg = MqttMessage {
            topic: "test".to_string(),
            payload: br#"{"value": 42}"#.to_vec(),
        };

        let parsed: TestPayload = msg.parse_json().unwrap();
        assert_eq!(parsed.value, 42);
    }
}
