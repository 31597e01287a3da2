//! # cadcollab Agent
//!
//! Collaboration server for shared design projects.
//!
//! ## Architecture
//!
//! - **Gateway**: accepts WebSocket clients and forwards their messages
//! - **Registry**: authenticates clients and routes them to a project's session
//! - **Coordinator**: one task per open project, owning its [`Session`]
//!   state and serializing every mutation, timer and fan-out event
//! - **Persistence**: periodic snapshots of session state and project
//!   checkpoints
//!
//! [`Session`]: cadcollab_core::Session

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod gateway;
pub mod memory;
pub mod persistence;
pub mod registry;
pub mod runtime;

pub use clock::TokioClock;
pub use config::AgentConfig;
pub use coordinator::{CoordinatorHandle, EventSink, Services};
pub use gateway::Gateway;
pub use memory::{MemoryAuthenticator, MemoryDocumentStore, MemoryPersistence};
pub use persistence::{PersistenceError, SessionSummary, SqliteStore};
pub use registry::{ClientConnection, SessionRegistry};
pub use runtime::Agent;
