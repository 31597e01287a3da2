//! MQTT-backed fan-out.

use crate::{FanOut, FanOutError};
use async_trait::async_trait;
use cadcollab_proto::{Envelope, MessageType, TopicScheme};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

type Routes = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>>;

/// Configuration for the MQTT fan-out.
#[derive(Debug, Clone)]
pub struct MqttFanOutConfig {
    /// MQTT broker URL (e.g., <tcp://localhost:1883>)
    pub broker: String,
    /// Client ID for MQTT connection
    pub client_id: String,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// Delay before polling again after a connection error
    pub reconnect_delay: Duration,
}

impl Default for MqttFanOutConfig {
    fn default() -> Self {
        Self {
            broker: "tcp://localhost:1883".to_string(),
            client_id: "cadcollab".to_string(),
            keep_alive: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Fan-out over an MQTT broker.
///
/// One background task polls the connection and routes incoming envelopes
/// to the subscribed project's receiver.
pub struct MqttFanOut {
    client: AsyncClient,
    topics: TopicScheme,
    routes: Routes,
}

impl MqttFanOut {
    /// Connect to the broker and start the polling task.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL is invalid.
    pub fn connect(config: MqttFanOutConfig, topics: TopicScheme) -> Result<Self, FanOutError> {
        let (host, port) = parse_mqtt_url(&config.broker)?;

        let mut mqtt_options = MqttOptions::new(&config.client_id, host, port);
        mqtt_options.set_keep_alive(config.keep_alive);

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);
        let routes: Routes = Arc::default();

        tokio::spawn(poll(
            eventloop,
            client.clone(),
            topics.clone(),
            Arc::clone(&routes),
            config.reconnect_delay,
        ));

        Ok(Self {
            client,
            topics,
            routes,
        })
    }

    /// Disconnect from the broker.
    ///
    /// # Errors
    ///
    /// Returns error if the disconnect request cannot be queued.
    pub async fn disconnect(&self) -> Result<(), FanOutError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| FanOutError::Publish(e.to_string()))
    }
}

async fn poll(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topics: TopicScheme,
    routes: Routes,
    reconnect_delay: Duration,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let Some((project_id, MessageType::Events)) = topics.parse(&publish.topic) else {
                    tracing::debug!(topic = %publish.topic, "Ignoring foreign topic");
                    continue;
                };

                let envelope = match Envelope::from_cbor(&publish.payload) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        tracing::warn!(
                            error = %err,
                            topic = %publish.topic,
                            payload_len = publish.payload.len(),
                            "Failed to decode envelope"
                        );
                        continue;
                    }
                };

                let sender = routes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&project_id)
                    .cloned();
                if let Some(sender) = sender {
                    if sender.send(envelope).is_err() {
                        tracing::debug!(project = %project_id, "Project receiver dropped");
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("Connected to MQTT broker");
                let projects: Vec<String> = routes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .keys()
                    .cloned()
                    .collect();
                for project_id in projects {
                    let topic = topics.events(&project_id);
                    if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                        tracing::warn!(topic, error = %e, "Resubscribe failed");
                    }
                }
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                tracing::debug!("Subscription acknowledged");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "MQTT error");
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
}

#[async_trait]
impl FanOut for MqttFanOut {
    async fn publish(&self, envelope: &Envelope) -> Result<(), FanOutError> {
        let topic = self.topics.events(&envelope.project_id);
        let payload = envelope
            .to_cbor()
            .map_err(|e| FanOutError::Serialize(e.to_string()))?;

        tracing::debug!(
            topic,
            payload_len = payload.len(),
            event = envelope.event.kind(),
            "Publishing event"
        );

        self.client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| FanOutError::Publish(e.to_string()))
    }

    async fn subscribe(
        &self,
        project_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>, FanOutError> {
        let topic = self.topics.events(project_id);
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(project_id.to_string(), tx);

        tracing::info!(topic, "Subscribing to project events");

        self.client
            .subscribe(&topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| FanOutError::Subscribe(e.to_string()))?;

        Ok(rx)
    }

    async fn unsubscribe(&self, project_id: &str) -> Result<(), FanOutError> {
        let topic = self.topics.events(project_id);
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(project_id);

        self.client
            .unsubscribe(&topic)
            .await
            .map_err(|e| FanOutError::Subscribe(e.to_string()))
    }
}

/// Parse MQTT URL into host and port.
///
/// Accepts `tcp://` and `mqtt://` URLs as well as bare `host[:port]`.
///
/// # Errors
///
/// Returns error for other schemes, a missing host or a bad port.
pub fn parse_mqtt_url(input: &str) -> Result<(String, u16), FanOutError> {
    let invalid = |reason: String| FanOutError::InvalidBrokerUrl(format!("{input}: {reason}"));

    if input.contains("://") {
        let url = Url::parse(input).map_err(|e| invalid(e.to_string()))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => return Err(invalid(format!("unsupported scheme '{scheme}'"))),
        }

        let host = url
            .host_str()
            .ok_or_else(|| invalid("missing host".to_string()))?;
        return Ok((host.to_string(), url.port().unwrap_or(1883)));
    }

    let (host, port) = match input.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (input, None),
    };
    if host.is_empty() {
        return Err(invalid("missing host".to_string()));
    }
    let port = match port {
        None => 1883,
        Some(port) if port.contains(':') => {
            return Err(invalid("too many ':' separators".to_string()));
        }
        Some(port) => port
            .parse()
            .map_err(|_| invalid(format!("invalid port '{port}'")))?,
    };

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mqtt_url_forms() {
        assert_eq!(
            parse_mqtt_url("tcp://localhost:1883").unwrap(),
            ("localhost".to_string(), 1883)
        );
        assert_eq!(
            parse_mqtt_url("mqtt://broker.example.com").unwrap(),
            ("broker.example.com".to_string(), 1883)
        );
        assert_eq!(
            parse_mqtt_url("10.0.0.5:2883").unwrap(),
            ("10.0.0.5".to_string(), 2883)
        );
        assert_eq!(
            parse_mqtt_url("broker").unwrap(),
            ("broker".to_string(), 1883)
        );
    }

    #[test]
    fn parse_mqtt_url_rejects_garbage() {
        assert!(parse_mqtt_url("ws://broker:80").is_err());
        assert!(parse_mqtt_url(":1883").is_err());
        assert!(parse_mqtt_url("broker:port").is_err());
        assert!(parse_mqtt_url("a:1:2").is_err());
    }
}
