//! Authenticated entry point mapping projects to their coordinators.

use crate::coordinator::{self, CoordinatorHandle, EventSink, Services};
use cadcollab_core::{CollabError, ConnectionId, UserId};
use cadcollab_proto::ClientMessage;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use uuid::Uuid;

/// A connection that passed authentication and joined a session.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    /// Connection identifier
    pub id: ConnectionId,
    /// Authenticated user
    pub user_id: UserId,
    /// Session joined
    pub session_id: Uuid,
    handle: CoordinatorHandle,
}

impl ClientConnection {
    /// Project of the joined session.
    #[must_use]
    pub fn project_id(&self) -> &str {
        self.handle.project_id()
    }

    /// Queue a client message on the session.
    ///
    /// # Errors
    ///
    /// Returns [`CollabError::Unavailable`] if the session queue is full or
    /// the session stopped.
    pub fn send(&self, message: ClientMessage) -> Result<(), CollabError> {
        self.handle.submit(self.id, message)
    }

    /// Leave the session.
    pub async fn close(self) {
        self.handle.leave(self.id).await;
    }
}

type Slot = Arc<OnceCell<CoordinatorHandle>>;

/// Owns one coordinator per open project.
///
/// The map lock only guards slot lookup. Loading a project happens inside
/// its slot, so a slow document store stalls joins for that project alone.
pub struct SessionRegistry {
    services: Services,
    coordinators: Mutex<HashMap<String, Slot>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(services: Services) -> Self {
        Self {
            services,
            coordinators: Mutex::new(HashMap::new()),
        }
    }

    /// Authenticate a token, check project access and join the project's
    /// session, starting its coordinator if needed.
    ///
    /// # Errors
    ///
    /// Returns [`CollabError::Auth`] for bad tokens or denied access, or the
    /// document store error if the project cannot be loaded.
    pub async fn connect(
        &self,
        token: &str,
        project_id: &str,
        sink: EventSink,
    ) -> Result<ClientConnection, CollabError> {
        if project_id.is_empty() {
            return Err(CollabError::InvalidRequest("project_id is empty".to_string()));
        }

        let profile = self.services.auth.authenticate(token).await?;
        if !self
            .services
            .auth
            .check_project_access(&profile.id, project_id)
            .await?
        {
            tracing::info!(user_id = %profile.id, project_id, "Project access denied");
            return Err(CollabError::Auth(format!(
                "{} may not open project {project_id}",
                profile.id
            )));
        }

        let handle = self.coordinator(project_id).await?;
        let id = Uuid::new_v4();
        let user_id = profile.id.clone();
        let session_id = handle.join(id, profile, sink).await?;

        Ok(ClientConnection {
            id,
            user_id,
            session_id,
            handle,
        })
    }

    async fn coordinator(&self, project_id: &str) -> Result<CoordinatorHandle, CollabError> {
        let slot = self.slot(project_id).await;
        let handle = slot
            .get_or_try_init(|| coordinator::spawn(project_id, self.services.clone()))
            .await?;
        Ok(handle.clone())
    }

    async fn slot(&self, project_id: &str) -> Slot {
        let mut coordinators = self.coordinators.lock().await;
        let stopped = coordinators
            .get(project_id)
            .and_then(|slot| slot.get())
            .is_some_and(CoordinatorHandle::is_closed);
        if stopped {
            coordinators.remove(project_id);
        }
        Arc::clone(coordinators.entry(project_id.to_string()).or_default())
    }

    /// Coordinator of an open project.
    pub async fn get(&self, project_id: &str) -> Option<CoordinatorHandle> {
        self.coordinators
            .lock()
            .await
            .get(project_id)
            .and_then(|slot| slot.get().cloned())
    }

    /// Number of open projects.
    pub async fn len(&self) -> usize {
        self.coordinators
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Whether no project is open.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Persist and stop every coordinator.
    pub async fn shutdown(&self) {
        let handles: Vec<CoordinatorHandle> = self
            .coordinators
            .lock()
            .await
            .drain()
            .filter_map(|(_, slot)| slot.get().cloned())
            .collect();

        tracing::info!(sessions = handles.len(), "Shutting down sessions");
        for handle in handles {
            handle.shutdown().await;
        }
    }
}
