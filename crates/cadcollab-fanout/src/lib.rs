//! # cadcollab Fan-out
//!
//! Relays session events between every server process hosting the same
//! project. The relay is keyed by project and has no business logic: it
//! publishes [`Envelope`]s and hands received ones back to the coordinator.
//!
//! - [`LocalFanOut`]: in-process hub, for single-node deployments and tests
//! - [`MqttFanOut`]: MQTT broker shared by all nodes
//!
//! Delivery is at-least-once and ordered per project channel, as far as the
//! fabric provides it. Receivers filter out their own envelopes by origin.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod local;
pub mod mqtt;

use async_trait::async_trait;
use cadcollab_proto::Envelope;
use tokio::sync::mpsc;

pub use local::LocalFanOut;
pub use mqtt::{parse_mqtt_url, MqttFanOut, MqttFanOutConfig};

/// A publish/subscribe fabric shared by server processes.
#[async_trait]
pub trait FanOut: Send + Sync {
    /// Publish an envelope on its project's channel.
    ///
    /// # Errors
    ///
    /// Returns error if the envelope cannot be encoded or handed to the fabric.
    async fn publish(&self, envelope: &Envelope) -> Result<(), FanOutError>;

    /// Start receiving a project's envelopes, including this node's own.
    ///
    /// # Errors
    ///
    /// Returns error if the subscription cannot be registered.
    async fn subscribe(&self, project_id: &str)
        -> Result<mpsc::UnboundedReceiver<Envelope>, FanOutError>;

    /// Stop receiving a project's envelopes.
    ///
    /// # Errors
    ///
    /// Returns error if the fabric rejects the request.
    async fn unsubscribe(&self, project_id: &str) -> Result<(), FanOutError>;
}

/// Errors for fan-out operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FanOutError {
    /// Invalid MQTT broker URL
    #[error("invalid MQTT broker URL: {0}")]
    InvalidBrokerUrl(String),
    /// Subscription failed
    #[error("subscription error: {0}")]
    Subscribe(String),
    /// Publish failed
    #[error("publish error: {0}")]
    Publish(String),
    /// Serialization failed
    #[error("serialize error: {0}")]
    Serialize(String),
}
