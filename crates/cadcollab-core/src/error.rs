//! Error taxonomy shared by the coordinator and its callers.

use crate::model::{EntityKey, UserId};
use uuid::Uuid;

/// Errors surfaced to clients and collaborators.
///
/// A detected conflict never rejects the operation that caused it; the
/// `conflict` code only answers a resolution that arrived after the conflict
/// was already closed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CollabError {
    /// Bad token or no access to the project. Ends the connection attempt.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The role lacks the capability. Rejects one operation.
    #[error("permission denied: {0}")]
    Permission(String),
    /// The entity is held by another user.
    #[error("{reason} on {entity} (held by {holder})")]
    Lock {
        /// Human readable reason
        reason: String,
        /// Current holder
        holder: UserId,
        /// Contended entity
        entity: EntityKey,
    },
    /// The conflict was resolved before this request
    #[error("conflict {conflict_id} on {entity} is already resolved")]
    Conflict {
        /// Conflict identifier
        conflict_id: Uuid,
        /// Contended entity
        entity: EntityKey,
    },
    /// Fan-out or persistence failure
    #[error("transport error: {0}")]
    Transport(String),
    /// The document store refused the operation
    #[error("document store error: {0}")]
    Store(String),
    /// Malformed request or unknown target
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The session cannot accept work right now
    #[error("session unavailable: {0}")]
    Unavailable(String),
}

impl CollabError {
    /// Stable wire code for `operation_error` events.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            CollabError::Auth(_) => "auth_error",
            CollabError::Permission(_) => "permission_error",
            CollabError::Lock { .. } => "lock_error",
            CollabError::Conflict { .. } => "conflict",
            CollabError::Transport(_) => "transport_error",
            CollabError::Store(_) => "store_error",
            CollabError::InvalidRequest(_) => "invalid_request",
            CollabError::Unavailable(_) => "unavailable",
        }
    }

    /// Holder identity for lock errors.
    #[must_use]
    pub fn holder(&self) -> Option<&str> {
        match self {
            CollabError::Lock { holder, .. } => Some(holder),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_error_names_holder() {
        let err = CollabError::Lock {
            reason: "Entity is locked by another user".to_string(),
            holder: "alice".to_string(),
            entity: EntityKey::component("C1"),
        };
        assert_eq!(err.code(), "lock_error");
        assert_eq!(err.holder(), Some("alice"));
        assert_eq!(
            err.to_string(),
            "Entity is locked by another user on component:C1 (held by alice)"
        );
    }
}
