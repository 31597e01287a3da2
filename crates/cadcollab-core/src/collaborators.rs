//! Narrow interfaces to the systems the engine coordinates but does not own.

use crate::conflict::merge_payloads;
use crate::error::CollabError;
use crate::model::{ProjectId, UserId, UserProfile};
use crate::oplog::Operation;
use crate::session::SessionState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Project metadata returned by [`DocumentStore::load_project`].
///
/// Carries no geometry; the engine only needs ownership and entity versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    /// Project identifier
    pub project_id: ProjectId,
    /// Owner, granted every permission
    #[serde(default)]
    pub owner_id: Option<UserId>,
    /// Store revision, bumped on every applied operation
    #[serde(default)]
    pub revision: u64,
    /// Current version per entity, keyed by `type:id`
    #[serde(default)]
    pub entity_versions: BTreeMap<String, u64>,
}

/// Answer of [`DocumentStore::merge_operations`].
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// The merged final state
    Merged(serde_json::Value),
    /// The document model cannot merge these payloads
    Unsupported,
}

/// Authentication and project access.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve a bearer token to a user.
    ///
    /// # Errors
    ///
    /// Returns [`CollabError::Auth`] for unknown or expired tokens.
    async fn authenticate(&self, token: &str) -> Result<UserProfile, CollabError>;

    /// Check whether a user may open a project.
    ///
    /// # Errors
    ///
    /// Returns an error when the access backend cannot be reached.
    async fn check_project_access(&self, user_id: &str, project_id: &str)
        -> Result<bool, CollabError>;
}

/// The store holding authoritative document state.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Apply an accepted operation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store refuses or cannot be reached.
    async fn apply_operation(&self, project_id: &str, operation: &Operation)
        -> Result<(), StoreError>;

    /// Load project metadata.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown projects.
    async fn load_project(&self, project_id: &str) -> Result<ProjectSnapshot, StoreError>;

    /// Checkpoint a project.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store refuses or cannot be reached.
    async fn save_project(&self, snapshot: &ProjectSnapshot) -> Result<(), StoreError>;

    /// Merge the payloads of conflicting operations.
    ///
    /// The default unions JSON object fields and gives up on overlap.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be reached.
    async fn merge_operations(
        &self,
        _project_id: &str,
        operations: &[Operation],
    ) -> Result<MergeOutcome, StoreError> {
        Ok(merge_payloads(operations).map_or(MergeOutcome::Unsupported, MergeOutcome::Merged))
    }
}

/// Durable sink for session snapshots.
#[async_trait]
pub trait SessionPersistence: Send + Sync {
    /// Persist a snapshot of session state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the snapshot cannot be written.
    async fn persist_session_state(&self, state: &SessionState) -> Result<(), StoreError>;
}

/// Collaborator failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The addressed resource does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// The store refused the request
    #[error("rejected: {0}")]
    Rejected(String),
    /// The store could not be reached
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for CollabError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => CollabError::InvalidRequest(msg),
            StoreError::Rejected(msg) => CollabError::Store(msg),
            StoreError::Unavailable(msg) => CollabError::Transport(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityKey;
    use crate::oplog::{OperationRequest, OperationType};
    use serde_json::json;
    use uuid::Uuid;

    struct NullStore;

    #[async_trait]
    impl DocumentStore for NullStore {
        async fn apply_operation(&self, _: &str, _: &Operation) -> Result<(), StoreError> {
            Ok(())
        }

        async fn load_project(&self, project_id: &str) -> Result<ProjectSnapshot, StoreError> {
            Err(StoreError::NotFound(project_id.to_string()))
        }

        async fn save_project(&self, _: &ProjectSnapshot) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn op(user: &str, payload: serde_json::Value) -> Operation {
        Operation::accept(
            OperationRequest {
                op_type: OperationType::Update,
                target: EntityKey::component("C2"),
                payload,
                base_version: None,
            },
            Uuid::nil(),
            user,
            0,
        )
    }

    #[test]
    fn default_merge_unions_fields() {
        let store = NullStore;
        let ops = [op("alice", json!({ "a": 1 })), op("bob", json!({ "b": 2 }))];
        let outcome = tokio_test::block_on(store.merge_operations("p", &ops)).unwrap();
        assert_eq!(outcome, MergeOutcome::Merged(json!({ "a": 1, "b": 2 })));

        let clash = [op("alice", json!({ "a": 1 })), op("bob", json!({ "a": 2 }))];
        let outcome = tokio_test::block_on(store.merge_operations("p", &clash)).unwrap();
        assert_eq!(outcome, MergeOutcome::Unsupported);
    }

    #[test]
    fn store_errors_map_to_wire_codes() {
        assert_eq!(
            CollabError::from(StoreError::Rejected("x".into())).code(),
            "store_error"
        );
        assert_eq!(
            CollabError::from(StoreError::Unavailable("x".into())).code(),
            "transport_error"
        );
    }
}
