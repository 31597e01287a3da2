//! `SQLite` session persistence.

use async_trait::async_trait;
use cadcollab_core::{SessionPersistence, SessionState, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// One row of the snapshot table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Project identifier
    pub project_id: String,
    /// Session that wrote the snapshot
    pub session_id: Uuid,
    /// Store revision at save time
    pub revision: u64,
    /// Retained log entries in the snapshot
    pub operation_count: u64,
    /// Save time
    pub saved_at: DateTime<Utc>,
}

/// `SQLite`-backed store for the latest session state per project.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> SqliteResult<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> SqliteResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> SqliteResult<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> SqliteResult<()> {
        self.conn().execute_batch(
            r"
            -- Latest session state per project
            CREATE TABLE IF NOT EXISTS session_snapshots (
                project_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                state_json TEXT NOT NULL,
                revision INTEGER NOT NULL,
                operation_count INTEGER NOT NULL,
                saved_at INTEGER NOT NULL
            );
            ",
        )?;

        Ok(())
    }

    /// Save a session snapshot, replacing the previous one of the project.
    ///
    /// # Errors
    ///
    /// Returns error if encoding or insert fails.
    pub fn save_session_state(&self, state: &SessionState) -> Result<(), PersistenceError> {
        let json = serde_json::to_string(state)
            .map_err(|e| PersistenceError::Encoding(e.to_string()))?;
        let operations = u64::try_from(state.recent_operations.len()).unwrap_or(u64::MAX);

        self.conn().execute(
            r"
            INSERT OR REPLACE INTO session_snapshots
                (project_id, session_id, state_json, revision, operation_count, saved_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            (
                &state.project_id,
                state.session_id.to_string(),
                json,
                to_i64(state.revision)?,
                to_i64(operations)?,
                Utc::now().timestamp_millis(),
            ),
        )?;

        Ok(())
    }

    /// Latest snapshot of a project.
    ///
    /// # Errors
    ///
    /// Returns error if the query or decoding fails.
    pub fn load_session_state(
        &self,
        project_id: &str,
    ) -> Result<Option<SessionState>, PersistenceError> {
        let json: Option<String> = self
            .conn()
            .query_row(
                "SELECT state_json FROM session_snapshots WHERE project_id = ?1",
                [project_id],
                |row| row.get(0),
            )
            .optional()?;

        json.map(|json| {
            serde_json::from_str(&json).map_err(|e| PersistenceError::Encoding(e.to_string()))
        })
        .transpose()
    }

    /// Every stored snapshot, most recently saved first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>, PersistenceError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r"
            SELECT project_id, session_id, revision, operation_count, saved_at
            FROM session_snapshots
            ORDER BY saved_at DESC, project_id ASC
            ",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<SqliteResult<Vec<_>>>()?;

        rows.into_iter()
            .map(|(project_id, session_id, revision, operations, saved_at)| {
                Ok(SessionSummary {
                    session_id: Uuid::parse_str(&session_id)
                        .map_err(|e| PersistenceError::Encoding(e.to_string()))?,
                    project_id,
                    revision: u64::try_from(revision).unwrap_or_default(),
                    operation_count: u64::try_from(operations).unwrap_or_default(),
                    saved_at: DateTime::from_timestamp_millis(saved_at).unwrap_or_default(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl SessionPersistence for SqliteStore {
    async fn persist_session_state(&self, state: &SessionState) -> Result<(), StoreError> {
        let store = self.clone();
        let state = state.clone();
        tokio::task::spawn_blocking(move || store.save_session_state(&state))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

fn to_i64(value: u64) -> SqliteResult<i64> {
    i64::try_from(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Database failure
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Snapshot could not be encoded or decoded
    #[error("snapshot encoding error: {0}")]
    Encoding(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(project_id: &str, revision: u64) -> SessionState {
        SessionState {
            session_id: Uuid::new_v4(),
            project_id: project_id.to_string(),
            users: Vec::new(),
            locks: Vec::new(),
            recent_operations: Vec::new(),
            conflicts: Vec::new(),
            revision,
            created_at_ms: 10,
            last_activity_ms: 20,
        }
    }

    #[test]
    fn latest_snapshot_wins() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.load_session_state("p1").unwrap().is_none());

        store.save_session_state(&state("p1", 1)).unwrap();
        let second = state("p1", 2);
        store.save_session_state(&second).unwrap();
        store.save_session_state(&state("p2", 7)).unwrap();

        assert_eq!(store.load_session_state("p1").unwrap(), Some(second));

        let sessions = store.list_sessions().unwrap();
        assert_eq!(sessions.len(), 2);
        let p2 = sessions.iter().find(|s| s.project_id == "p2").unwrap();
        assert_eq!(p2.revision, 7);
        assert_eq!(p2.operation_count, 0);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let saved = state("bridge/7", 3);

        SqliteStore::open(&path)
            .unwrap()
            .save_session_state(&saved)
            .unwrap();

        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.load_session_state("bridge/7").unwrap(), Some(saved));
    }

    #[tokio::test]
    async fn persists_through_the_collaborator_trait() {
        let store = SqliteStore::in_memory().unwrap();
        store.persist_session_state(&state("p1", 4)).await.unwrap();
        assert_eq!(store.load_session_state("p1").unwrap().unwrap().revision, 4);
    }
}
