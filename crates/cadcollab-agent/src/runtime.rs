//! Agent runtime orchestration.

use crate::clock::TokioClock;
use crate::config::{AgentConfig, CollaboratorKind, FanOutKind, PersistenceKind};
use crate::coordinator::Services;
use crate::gateway::Gateway;
use crate::memory::{MemoryAuthenticator, MemoryDocumentStore, MemoryPersistence};
use crate::persistence::SqliteStore;
use crate::registry::SessionRegistry;
use anyhow::{Context, Result};
use cadcollab_adapter_http::{HttpBackend, HttpBackendConfig};
use cadcollab_core::{Authenticator, DocumentStore, SessionPersistence};
use cadcollab_fanout::{FanOut, LocalFanOut, MqttFanOut, MqttFanOutConfig};
use cadcollab_proto::TopicScheme;
use std::sync::Arc;
use uuid::Uuid;

/// The collaboration server.
pub struct Agent {
    config: AgentConfig,
    node_id: Uuid,
}

impl Agent {
    /// Create an agent from configuration.
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        let node_id = config.node_id.unwrap_or_else(Uuid::new_v4);
        Self { config, node_id }
    }

    /// Node identifier stamped on fan-out envelopes.
    #[must_use]
    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// Build the collaborators and fan-out named by the configuration.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if a backend cannot be created or opened.
    pub fn services(&self) -> Result<Services> {
        let config = &self.config;
        let mut http: Option<Arc<HttpBackend>> = None;
        let mut http_backend = || -> Result<Arc<HttpBackend>> {
            if let Some(backend) = &http {
                return Ok(Arc::clone(backend));
            }
            let backend = Arc::new(
                HttpBackend::new(HttpBackendConfig {
                    base_url: config.collaborators.backend_url.clone(),
                    bearer_token: config.collaborators.backend_token.clone(),
                    ..HttpBackendConfig::default()
                })
                .context("Failed to create HTTP backend client")?,
            );
            http = Some(Arc::clone(&backend));
            Ok(backend)
        };

        let (auth, store): (Arc<dyn Authenticator>, Arc<dyn DocumentStore>) =
            match config.collaborators.kind {
                CollaboratorKind::Memory => {
                    if config.collaborators.tokens.is_empty() {
                        tracing::warn!("No tokens configured; every authentication will fail");
                    }
                    let auth: Arc<dyn Authenticator> = Arc::new(MemoryAuthenticator::new(
                        config.collaborators.tokens.clone(),
                    ));
                    (auth, Arc::new(MemoryDocumentStore::new()) as Arc<dyn DocumentStore>)
                }
                CollaboratorKind::Http => {
                    let backend = http_backend()?;
                    let auth: Arc<dyn Authenticator> = backend.clone();
                    (auth, backend as Arc<dyn DocumentStore>)
                }
            };

        let persistence: Arc<dyn SessionPersistence> = match config.persistence.store_type {
            PersistenceKind::Sqlite => Arc::new(
                SqliteStore::open(&config.persistence.db_path)
                    .context("Failed to open SQLite database")?,
            ),
            PersistenceKind::Http => http_backend()? as Arc<dyn SessionPersistence>,
            PersistenceKind::Memory => Arc::new(MemoryPersistence::new()),
        };

        let topics = TopicScheme::new(&config.fanout.tenant);
        let fanout: Arc<dyn FanOut> = match config.fanout.kind {
            FanOutKind::Local => Arc::new(LocalFanOut::new(topics)),
            FanOutKind::Mqtt => Arc::new(
                MqttFanOut::connect(
                    MqttFanOutConfig {
                        broker: config.fanout.mqtt_broker.clone(),
                        client_id: format!("cadcollab-{}", self.node_id),
                        ..MqttFanOutConfig::default()
                    },
                    topics,
                )
                .context("Failed to create MQTT fan-out")?,
            ),
        };

        Ok(Services {
            auth,
            store,
            persistence,
            fanout,
            clock: Arc::new(TokioClock::new()),
            node_id: self.node_id,
            settings: config.session.clone(),
        })
    }

    /// Serve clients until Ctrl-C, then persist every session.
    ///
    /// # Errors
    ///
    /// Returns error if startup fails or the gateway stops accepting.
    pub async fn run(self) -> Result<()> {
        tracing::info!(
            node_id = %self.node_id,
            fanout = ?self.config.fanout.kind,
            collaborators = ?self.config.collaborators.kind,
            persistence = ?self.config.persistence.store_type,
            "Starting agent runtime"
        );

        let registry = Arc::new(SessionRegistry::new(self.services()?));
        let gateway = Gateway::bind(&self.config.gateway.bind_addr, Arc::clone(&registry))
            .await
            .with_context(|| format!("Failed to bind {}", self.config.gateway.bind_addr))?;

        tracing::info!("Agent running, press Ctrl+C to stop");

        let result = tokio::select! {
            result = gateway.run() => result.context("Gateway stopped"),
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
        };

        registry.shutdown().await;
        tracing::info!("Agent stopped");
        result
    }
}
