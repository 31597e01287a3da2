//! # cadcollab Protocol
//!
//! Messages exchanged with clients and between server processes.
//!
//! ## Client protocol
//!
//! JSON objects tagged by `type`, one per WebSocket text frame:
//!
//! - [`ClientMessage`]: `authenticate`, `cursor_move`, `component_operation`, ...
//! - [`ServerEvent`]: `session_joined`, `lock_acquired`, `conflict_detected`, ...
//!
//! ## Replication
//!
//! Every broadcast event is wrapped in an [`Envelope`] and published as CBOR
//! on `cadcollab/v1/{tenant}/{project}/events`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod topics;

pub use messages::{
    Audience, ClientMessage, Comment, Envelope, MessageError, ReleaseReason, ServerEvent,
};
pub use topics::{MessageType, TopicScheme};
