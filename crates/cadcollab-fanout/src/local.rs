//! In-process fan-out hub.
//!
//! Envelopes go through the same CBOR encoding as on a real broker, so what
//! works here also survives the wire.

use crate::{FanOut, FanOutError};
use async_trait::async_trait;
use cadcollab_proto::{Envelope, TopicScheme};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

type Routes = HashMap<String, Vec<(u64, mpsc::UnboundedSender<Envelope>)>>;

#[derive(Debug, Default)]
struct Hub {
    routes: Mutex<Routes>,
    next_handle: Mutex<u64>,
}

impl Hub {
    fn handle(&self) -> u64 {
        let mut next = self.next_handle.lock().unwrap_or_else(PoisonError::into_inner);
        *next += 1;
        *next
    }
}

/// Handle onto an in-process hub.
///
/// Handles made with [`LocalFanOut::peer`] share the hub and behave like
/// separate server processes on one broker.
#[derive(Debug, Clone)]
pub struct LocalFanOut {
    hub: Arc<Hub>,
    handle: u64,
    topics: TopicScheme,
}

impl Default for LocalFanOut {
    fn default() -> Self {
        Self::new(TopicScheme::default())
    }
}

impl LocalFanOut {
    /// Create a hub and the first handle onto it.
    #[must_use]
    pub fn new(topics: TopicScheme) -> Self {
        let hub = Arc::new(Hub::default());
        let handle = hub.handle();
        Self {
            hub,
            handle,
            topics,
        }
    }

    /// Another handle onto the same hub.
    #[must_use]
    pub fn peer(&self) -> Self {
        Self {
            hub: Arc::clone(&self.hub),
            handle: self.hub.handle(),
            topics: self.topics.clone(),
        }
    }

    fn routes(&self) -> std::sync::MutexGuard<'_, Routes> {
        self.hub
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl FanOut for LocalFanOut {
    async fn publish(&self, envelope: &Envelope) -> Result<(), FanOutError> {
        let topic = self.topics.events(&envelope.project_id);
        let bytes = envelope
            .to_cbor()
            .map_err(|e| FanOutError::Serialize(e.to_string()))?;

        let mut routes = self.routes();
        let Some(subscribers) = routes.get_mut(&topic) else {
            return Ok(());
        };

        let mut delivered = 0usize;
        for (_, sender) in subscribers.iter() {
            let copy =
                Envelope::from_cbor(&bytes).map_err(|e| FanOutError::Serialize(e.to_string()))?;
            if sender.send(copy).is_ok() {
                delivered += 1;
            }
        }
        subscribers.retain(|(_, sender)| !sender.is_closed());

        tracing::trace!(topic, delivered, event = envelope.event.kind(), "Published locally");
        Ok(())
    }

    async fn subscribe(
        &self,
        project_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>, FanOutError> {
        let topic = self.topics.events(project_id);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut routes = self.routes();
        let subscribers = routes.entry(topic).or_default();
        subscribers.retain(|(handle, _)| *handle != self.handle);
        subscribers.push((self.handle, tx));

        Ok(rx)
    }

    async fn unsubscribe(&self, project_id: &str) -> Result<(), FanOutError> {
        let topic = self.topics.events(project_id);
        let mut routes = self.routes();
        if let Some(subscribers) = routes.get_mut(&topic) {
            subscribers.retain(|(handle, _)| *handle != self.handle);
            if subscribers.is_empty() {
                routes.remove(&topic);
            }
        }
        Ok(())
    }
}
