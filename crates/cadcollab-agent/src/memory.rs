//! In-memory collaborators for single-node runs and tests.

use async_trait::async_trait;
use cadcollab_core::{
    Authenticator, CollabError, DocumentStore, EntityKey, Operation, ProjectId, ProjectSnapshot,
    SessionPersistence, SessionState, StoreError, UserId, UserProfile,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Static token table.
///
/// Every authenticated user may open every project unless the project was
/// restricted with [`MemoryAuthenticator::restrict`].
#[derive(Debug, Default)]
pub struct MemoryAuthenticator {
    tokens: HashMap<String, UserProfile>,
    restricted: Mutex<HashMap<ProjectId, HashSet<UserId>>>,
}

impl MemoryAuthenticator {
    /// Create an authenticator over a token table.
    #[must_use]
    pub fn new(tokens: HashMap<String, UserProfile>) -> Self {
        Self {
            tokens,
            restricted: Mutex::default(),
        }
    }

    /// Limit a project to the given users.
    pub fn restrict<I, S>(&self, project_id: &str, users: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<UserId>,
    {
        guard(&self.restricted).insert(
            project_id.to_string(),
            users.into_iter().map(Into::into).collect(),
        );
    }
}

#[async_trait]
impl Authenticator for MemoryAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<UserProfile, CollabError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| CollabError::Auth("invalid token".to_string()))
    }

    async fn check_project_access(
        &self,
        user_id: &str,
        project_id: &str,
    ) -> Result<bool, CollabError> {
        Ok(guard(&self.restricted)
            .get(project_id)
            .map_or(true, |allowed| allowed.contains(user_id)))
    }
}

#[derive(Debug, Default)]
struct Documents {
    projects: HashMap<ProjectId, ProjectSnapshot>,
    applied: Vec<(ProjectId, Operation)>,
    rejected: HashSet<EntityKey>,
    saves: usize,
}

/// Document store keeping project metadata and an apply journal in memory.
///
/// Unknown projects are created empty on first load.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    inner: Mutex<Documents>,
}

impl MemoryDocumentStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a project.
    pub fn insert_project(&self, snapshot: ProjectSnapshot) {
        guard(&self.inner)
            .projects
            .insert(snapshot.project_id.clone(), snapshot);
    }

    /// Refuse every future apply on `entity`.
    pub fn reject(&self, entity: EntityKey) {
        guard(&self.inner).rejected.insert(entity);
    }

    /// Operations applied to a project, in apply order.
    #[must_use]
    pub fn applied(&self, project_id: &str) -> Vec<Operation> {
        guard(&self.inner)
            .applied
            .iter()
            .filter(|(project, _)| project == project_id)
            .map(|(_, op)| op.clone())
            .collect()
    }

    /// Current project metadata.
    #[must_use]
    pub fn project(&self, project_id: &str) -> Option<ProjectSnapshot> {
        guard(&self.inner).projects.get(project_id).cloned()
    }

    /// Number of checkpoints written.
    #[must_use]
    pub fn save_count(&self) -> usize {
        guard(&self.inner).saves
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn apply_operation(
        &self,
        project_id: &str,
        operation: &Operation,
    ) -> Result<(), StoreError> {
        let mut docs = guard(&self.inner);
        if docs.rejected.contains(&operation.target) {
            return Err(StoreError::Rejected(format!(
                "{} is read-only",
                operation.target
            )));
        }

        let project = docs
            .projects
            .entry(project_id.to_string())
            .or_insert_with(|| ProjectSnapshot {
                project_id: project_id.to_string(),
                ..ProjectSnapshot::default()
            });
        project.revision += 1;
        *project
            .entity_versions
            .entry(operation.target.to_string())
            .or_default() += 1;

        docs.applied.push((project_id.to_string(), operation.clone()));
        Ok(())
    }

    async fn load_project(&self, project_id: &str) -> Result<ProjectSnapshot, StoreError> {
        let mut docs = guard(&self.inner);
        Ok(docs
            .projects
            .entry(project_id.to_string())
            .or_insert_with(|| ProjectSnapshot {
                project_id: project_id.to_string(),
                ..ProjectSnapshot::default()
            })
            .clone())
    }

    async fn save_project(&self, snapshot: &ProjectSnapshot) -> Result<(), StoreError> {
        let mut docs = guard(&self.inner);
        docs.saves += 1;
        docs.projects
            .insert(snapshot.project_id.clone(), snapshot.clone());
        Ok(())
    }
}

/// Keeps the latest session state per project.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    states: Mutex<HashMap<ProjectId, SessionState>>,
}

impl MemoryPersistence {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest persisted state of a project.
    #[must_use]
    pub fn latest(&self, project_id: &str) -> Option<SessionState> {
        guard(&self.states).get(project_id).cloned()
    }
}

#[async_trait]
impl SessionPersistence for MemoryPersistence {
    async fn persist_session_state(&self, state: &SessionState) -> Result<(), StoreError> {
        guard(&self.states).insert(state.project_id.clone(), state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadcollab_core::{OperationRequest, OperationType, Role};
    use serde_json::json;
    use uuid::Uuid;

    fn profile(id: &str) -> UserProfile {
        UserProfile {
            id: id.to_string(),
            name: id.to_uppercase(),
            role: Role::Editor,
        }
    }

    fn op(target: EntityKey) -> Operation {
        Operation::accept(
            OperationRequest {
                op_type: OperationType::Update,
                target,
                payload: json!({ "w": 1 }),
                base_version: None,
            },
            Uuid::nil(),
            "alice",
            0,
        )
    }

    #[tokio::test]
    async fn tokens_and_restrictions() {
        let auth = MemoryAuthenticator::new(HashMap::from([("t1".to_string(), profile("alice"))]));

        assert_eq!(auth.authenticate("t1").await.unwrap().id, "alice");
        assert_eq!(auth.authenticate("nope").await.unwrap_err().code(), "auth_error");

        assert!(auth.check_project_access("alice", "p1").await.unwrap());
        auth.restrict("p1", ["bob"]);
        assert!(!auth.check_project_access("alice", "p1").await.unwrap());
        assert!(auth.check_project_access("bob", "p1").await.unwrap());
    }

    #[tokio::test]
    async fn store_tracks_versions_and_rejections() {
        let store = MemoryDocumentStore::new();
        let c1 = EntityKey::component("C1");

        assert_eq!(store.load_project("p1").await.unwrap().revision, 0);
        store.apply_operation("p1", &op(c1.clone())).await.unwrap();

        let project = store.project("p1").unwrap();
        assert_eq!(project.revision, 1);
        assert_eq!(project.entity_versions["component:C1"], 1);
        assert_eq!(store.applied("p1").len(), 1);

        store.reject(c1.clone());
        let err = store.apply_operation("p1", &op(c1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert_eq!(store.applied("p1").len(), 1);
    }
}
