//! # cadcollab Core
//!
//! Coordination state for real-time multi-user editing of a shared design
//! project.
//!
//! This crate provides:
//! - Presence tracking with heartbeat-based liveness
//! - Time-bounded entity locks (exclusive, shared, intent)
//! - A bounded, append-only operation log per session
//! - Conflict detection over a trailing window and policy-based resolution
//! - A timer wheel keyed by generation so stale timers are ignored
//! - The [`Session`] aggregate tying the above together per project
//!
//! Everything here is synchronous and takes the current time in milliseconds
//! as an argument. Scheduling, I/O and fan-out live in the agent.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod collaborators;
pub mod conflict;
pub mod error;
pub mod lock;
pub mod model;
pub mod oplog;
pub mod presence;
pub mod session;
pub mod timers;

pub use clock::Clock;
pub use collaborators::{
    Authenticator, DocumentStore, MergeOutcome, ProjectSnapshot, SessionPersistence, StoreError,
};
pub use conflict::{
    merge_payloads, Conflict, ConflictDetector, ConflictKind, ConflictRegistry, Resolution,
    ResolutionKind, ResolutionPlan, Severity, SYSTEM_RESOLVER,
};
pub use error::CollabError;
pub use lock::{Lock, LockDecision, LockDenial, LockKind, LockManager};
pub use model::{
    ConnectionId, CursorPosition, EntityKey, EntityType, Permission, PermissionSet, Presence,
    ProjectId, Role, User, UserId, UserProfile,
};
pub use oplog::{Operation, OperationLog, OperationRequest, OperationType};
pub use presence::{Joined, Left, PresenceStore};
pub use session::{Departure, Expiry, Session, SessionSettings, SessionState, Submission};
pub use timers::{Timer, TimerTarget, TimerWheel};
