//! Client messages, server events and the replication envelope.

use cadcollab_core::{
    CollabError, Conflict, CursorPosition, EntityKey, Lock, LockKind, Operation,
    OperationRequest, Resolution, ResolutionKind, User, UserId,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Inbound message from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First frame of every connection
    Authenticate {
        /// Bearer token
        token: String,
        /// Project to join
        project_id: String,
    },
    /// Liveness ping
    Heartbeat,
    /// Cursor moved
    CursorMove {
        /// New position
        position: CursorPosition,
    },
    /// Selection changed
    SelectionChange {
        /// Selected entity ids
        selection: Vec<String>,
    },
    /// Mutation of a component, model, analysis or BOM entity
    ComponentOperation {
        /// The mutation
        operation: OperationRequest,
    },
    /// Mutation of a drawing entity
    DrawingOperation {
        /// The mutation
        operation: OperationRequest,
    },
    /// Ask for a lock
    LockRequest {
        /// Entity to lock
        entity: EntityKey,
        /// Lock mode
        kind: LockKind,
    },
    /// Give a lock back
    LockRelease {
        /// Locked entity
        entity: EntityKey,
    },
    /// Attach a comment to an entity
    CommentAdd {
        /// Commented entity
        entity: EntityKey,
        /// Comment body
        text: String,
        /// Anchor in model space
        #[serde(default)]
        position: Option<CursorPosition>,
    },
    /// Decide an open conflict
    ConflictResolve {
        /// Conflict to resolve
        conflict_id: Uuid,
        /// Policy
        resolution: ResolutionKind,
        /// Final state for `custom`
        #[serde(default)]
        final_state: Option<serde_json::Value>,
    },
}

impl ClientMessage {
    /// Parse a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns error if the frame is not a known message.
    pub fn from_json(text: &str) -> Result<Self, MessageError> {
        serde_json::from_str(text).map_err(|e| MessageError::Deserialize(e.to_string()))
    }

    /// Wire name of the message.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Authenticate { .. } => "authenticate",
            ClientMessage::Heartbeat => "heartbeat",
            ClientMessage::CursorMove { .. } => "cursor_move",
            ClientMessage::SelectionChange { .. } => "selection_change",
            ClientMessage::ComponentOperation { .. } => "component_operation",
            ClientMessage::DrawingOperation { .. } => "drawing_operation",
            ClientMessage::LockRequest { .. } => "lock_request",
            ClientMessage::LockRelease { .. } => "lock_release",
            ClientMessage::CommentAdd { .. } => "comment_add",
            ClientMessage::ConflictResolve { .. } => "conflict_resolve",
        }
    }
}

/// Why a lock went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// The holder released it
    Explicit,
    /// The lock timed out
    Expired,
    /// The holder went offline
    Disconnected,
}

/// A comment on an entity. Broadcast only, never logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    /// Comment identifier
    pub id: Uuid,
    /// Author
    pub user_id: UserId,
    /// Commented entity
    pub entity: EntityKey,
    /// Body
    pub text: String,
    /// Anchor in model space
    #[serde(default)]
    pub position: Option<CursorPosition>,
    /// Creation time
    pub created_at_ms: u64,
}

/// Outbound event to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Initial state for a joining connection
    SessionJoined {
        /// Session identifier
        session_id: Uuid,
        /// Project identifier
        project_id: String,
        /// The joining user as stored
        user: User,
        /// Every known user
        users: Vec<User>,
        /// Live locks
        locks: Vec<Lock>,
        /// Recent operations, oldest first
        history: Vec<Operation>,
        /// Open conflicts
        conflicts: Vec<Conflict>,
    },
    /// A user came online
    UserJoined {
        /// The user
        user: User,
    },
    /// A user went offline
    UserLeft {
        /// The user
        user_id: UserId,
    },
    /// Cursor update
    CursorMoved {
        /// Moving user
        user_id: UserId,
        /// New position
        position: CursorPosition,
    },
    /// Selection update
    SelectionChanged {
        /// Selecting user
        user_id: UserId,
        /// Selected entity ids
        selection: Vec<String>,
    },
    /// Accepted component mutation
    ComponentOperation {
        /// The operation
        operation: Operation,
    },
    /// Accepted drawing mutation
    DrawingOperation {
        /// The operation
        operation: Operation,
    },
    /// Lock granted or re-confirmed
    LockAcquired {
        /// The lock as now held
        lock: Lock,
        /// Whether it re-confirmed an existing lock
        renewed: bool,
    },
    /// Lock request refused
    LockDenied {
        /// Requested entity
        entity: EntityKey,
        /// Human readable reason
        reason: String,
        /// Blocking holder
        holder: UserId,
    },
    /// Lock gone
    LockReleased {
        /// The released lock
        lock: Lock,
        /// Why
        reason: ReleaseReason,
    },
    /// Conflict raised or extended
    ConflictDetected {
        /// The conflict
        conflict: Conflict,
    },
    /// Conflict closed
    ConflictResolved {
        /// Conflict identifier
        conflict_id: Uuid,
        /// Contended entity
        entity: EntityKey,
        /// How it was settled
        resolution: Resolution,
    },
    /// The document store applied the submitter's operation
    OperationAcknowledged {
        /// Operation identifier
        operation_id: Uuid,
        /// Log position
        sequence: u64,
    },
    /// A request failed
    OperationError {
        /// Stable error code
        code: String,
        /// Human readable message
        message: String,
        /// Lock holder for `lock_error`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        holder: Option<UserId>,
        /// Failed operation, when there was one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation_id: Option<Uuid>,
    },
    /// A comment was added
    CommentAdded {
        /// The comment
        comment: Comment,
    },
}

impl ServerEvent {
    /// Error event for a failed request.
    #[must_use]
    pub fn error(err: &CollabError, operation_id: Option<Uuid>) -> Self {
        ServerEvent::OperationError {
            code: err.code().to_string(),
            message: err.to_string(),
            holder: err.holder().map(str::to_string),
            operation_id,
        }
    }

    /// Operation event on the channel matching its target.
    #[must_use]
    pub fn operation(operation: Operation) -> Self {
        if operation.is_drawing() {
            ServerEvent::DrawingOperation { operation }
        } else {
            ServerEvent::ComponentOperation { operation }
        }
    }

    /// Whether the event answers one connection and is never replicated.
    #[must_use]
    pub fn is_direct(&self) -> bool {
        matches!(
            self,
            ServerEvent::SessionJoined { .. }
                | ServerEvent::LockDenied { .. }
                | ServerEvent::OperationAcknowledged { .. }
                | ServerEvent::OperationError { .. }
        )
    }

    /// Wire name of the event.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::SessionJoined { .. } => "session_joined",
            ServerEvent::UserJoined { .. } => "user_joined",
            ServerEvent::UserLeft { .. } => "user_left",
            ServerEvent::CursorMoved { .. } => "cursor_moved",
            ServerEvent::SelectionChanged { .. } => "selection_changed",
            ServerEvent::ComponentOperation { .. } => "component_operation",
            ServerEvent::DrawingOperation { .. } => "drawing_operation",
            ServerEvent::LockAcquired { .. } => "lock_acquired",
            ServerEvent::LockDenied { .. } => "lock_denied",
            ServerEvent::LockReleased { .. } => "lock_released",
            ServerEvent::ConflictDetected { .. } => "conflict_detected",
            ServerEvent::ConflictResolved { .. } => "conflict_resolved",
            ServerEvent::OperationAcknowledged { .. } => "operation_acknowledged",
            ServerEvent::OperationError { .. } => "operation_error",
            ServerEvent::CommentAdded { .. } => "comment_added",
        }
    }

    /// Serialize to a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(|e| MessageError::Serialize(e.to_string()))
    }
}

/// Who should receive a replicated event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    /// Every connection in the session
    Session,
    /// Connections of the listed users
    Users(Vec<UserId>),
}

/// An event replicated between server processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Publishing node
    pub origin: Uuid,
    /// Project the event belongs to
    pub project_id: String,
    /// Recipients
    pub audience: Audience,
    /// The event
    pub event: ServerEvent,
    /// Publish time
    pub sent_at_ms: u64,
}

impl Envelope {
    /// Wrap an event.
    #[must_use]
    pub fn new(
        origin: Uuid,
        project_id: impl Into<String>,
        audience: Audience,
        event: ServerEvent,
        sent_at_ms: u64,
    ) -> Self {
        Self {
            origin,
            project_id: project_id.into(),
            audience,
            event,
            sent_at_ms,
        }
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// Message encoding errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadcollab_core::{OperationType, UserProfile, Role};
    use serde_json::json;

    #[test]
    fn parses_client_frames() {
        let frame = r#"{"type":"lock_request","entity":{"entity_type":"component","entity_id":"C1"},"kind":"exclusive"}"#;
        let msg = ClientMessage::from_json(frame).unwrap();
        assert_eq!(
            msg,
            ClientMessage::LockRequest {
                entity: EntityKey::component("C1"),
                kind: LockKind::Exclusive,
            }
        );

        let frame = r#"{"type":"component_operation","operation":{"op_type":"update","target":{"entity_type":"component","entity_id":"C2"},"payload":{"width":4}}}"#;
        match ClientMessage::from_json(frame).unwrap() {
            ClientMessage::ComponentOperation { operation } => {
                assert_eq!(operation.op_type, OperationType::Update);
                assert_eq!(operation.payload, json!({ "width": 4 }));
                assert!(operation.base_version.is_none());
            }
            other => panic!("unexpected {}", other.kind()),
        }

        assert!(ClientMessage::from_json(r#"{"type":"teleport"}"#).is_err());
    }

    #[test]
    fn lock_error_carries_holder() {
        let err = CollabError::Lock {
            reason: "Entity is locked by another user".to_string(),
            holder: "alice".to_string(),
            entity: EntityKey::component("C1"),
        };
        let text = ServerEvent::error(&err, None).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "operation_error");
        assert_eq!(value["code"], "lock_error");
        assert_eq!(value["holder"], "alice");
        assert!(value.get("operation_id").is_none());
    }

    #[test]
    fn drawing_operations_use_drawing_channel() {
        let op = Operation::accept(
            OperationRequest {
                op_type: OperationType::Move,
                target: EntityKey::drawing("D1"),
                payload: json!({ "dx": 1 }),
                base_version: None,
            },
            Uuid::nil(),
            "alice",
            0,
        );
        assert_eq!(ServerEvent::operation(op).kind(), "drawing_operation");
    }

    #[test]
    fn envelope_survives_cbor() {
        let user = User::from_profile(
            UserProfile {
                id: "bob".to_string(),
                name: "Bob".to_string(),
                role: Role::Editor,
            },
            false,
            42,
        );
        let envelope = Envelope::new(
            Uuid::new_v4(),
            "project/1",
            Audience::Users(vec!["bob".to_string()]),
            ServerEvent::UserJoined { user },
            42,
        );

        let bytes = envelope.to_cbor().unwrap();
        assert_eq!(Envelope::from_cbor(&bytes).unwrap(), envelope);
    }

    #[test]
    fn direct_events_are_flagged() {
        assert!(ServerEvent::OperationAcknowledged {
            operation_id: Uuid::nil(),
            sequence: 1
        }
        .is_direct());
        assert!(!ServerEvent::UserLeft {
            user_id: "a".to_string()
        }
        .is_direct());
    }
}
