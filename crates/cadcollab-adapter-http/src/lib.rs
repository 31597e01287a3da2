//! # HTTP Adapter
//!
//! REST client for the collaborators the engine consumes: authentication and
//! project access, the document store and session persistence.
//!
//! ## Endpoints
//!
//! | Operation | Request |
//! |-----------|---------|
//! | authenticate | `POST /auth/verify` |
//! | check project access | `GET /projects/{project}/access/{user}` |
//! | apply operation | `POST /projects/{project}/operations` |
//! | load project | `GET /projects/{project}` |
//! | save project | `PUT /projects/{project}/snapshot` |
//! | merge operations | `POST /projects/{project}/merge` |
//! | persist session state | `PUT /projects/{project}/session` |
//!
//! Path segments are percent-encoded; bodies are JSON.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod encoding;

pub use client::{ClientError, HttpBackend, HttpBackendConfig};
pub use encoding::{decode_path_segment, encode_path_segment};
