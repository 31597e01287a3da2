//! Pub/sub topic scheme for cross-process fan-out.
//!
//! Topic structure: `cadcollab/v1/{tenant}/{project}/{message_type}`
//!
//! Project ids are percent-encoded so `/`, `+` and `#` cannot leak into the
//! topic hierarchy. All events of a project share one channel so their
//! delivery order is preserved.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};

/// Protocol version for topic scheme.
pub const PROTOCOL_VERSION: &str = "v1";

/// Characters left unescaped in project segments.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

/// Topic scheme configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicScheme {
    /// Tenant identifier
    pub tenant: String,
    /// Topic prefix (default: "cadcollab")
    pub prefix: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new("default")
    }
}

impl TopicScheme {
    /// Create a topic scheme for the given tenant.
    #[must_use]
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            prefix: "cadcollab".to_string(),
        }
    }

    fn tenant_base(&self) -> String {
        format!("{}/{}/{}", self.prefix, PROTOCOL_VERSION, self.tenant)
    }

    fn base(&self, project_id: &str) -> String {
        format!(
            "{}/{}",
            self.tenant_base(),
            utf8_percent_encode(project_id, SEGMENT)
        )
    }

    /// Topic carrying every replicated event of a project.
    #[must_use]
    pub fn events(&self, project_id: &str) -> String {
        format!("{}/events", self.base(project_id))
    }

    /// Wildcard subscription for all messages of a project.
    #[must_use]
    pub fn project_wildcard(&self, project_id: &str) -> String {
        format!("{}/#", self.base(project_id))
    }

    /// Wildcard subscription for all messages in the tenant.
    #[must_use]
    pub fn tenant_wildcard(&self) -> String {
        format!("{}/#", self.tenant_base())
    }

    /// Parse a topic into its decoded project id and message type.
    #[must_use]
    pub fn parse(&self, topic: &str) -> Option<(String, MessageType)> {
        let remainder = topic.strip_prefix(&self.tenant_base())?.strip_prefix('/')?;
        let (project, kind) = remainder.split_once('/')?;

        let kind = match kind {
            "events" => MessageType::Events,
            _ => return None,
        };
        let project = percent_decode_str(project).decode_utf8().ok()?.into_owned();

        Some((project, kind))
    }
}

/// Message types in the topic scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Replicated session events
    Events,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_generation() {
        let scheme = TopicScheme::new("acme");

        assert_eq!(scheme.events("bridge-7"), "cadcollab/v1/acme/bridge-7/events");
        assert_eq!(scheme.project_wildcard("bridge-7"), "cadcollab/v1/acme/bridge-7/#");
        assert_eq!(scheme.tenant_wildcard(), "cadcollab/v1/acme/#");
    }

    #[test]
    fn project_ids_are_escaped() {
        let scheme = TopicScheme::new("acme");
        let topic = scheme.events("site/a#1");

        assert_eq!(topic, "cadcollab/v1/acme/site%2Fa%231/events");
        assert_eq!(
            scheme.parse(&topic),
            Some(("site/a#1".to_string(), MessageType::Events))
        );
    }

    #[test]
    fn rejects_foreign_topics() {
        let scheme = TopicScheme::new("acme");

        assert!(scheme.parse("cadcollab/v1/other/p1/events").is_none());
        assert!(scheme.parse("cadcollab/v1/acme/p1/delta").is_none());
        assert!(scheme.parse("cadcollab/v1/acme").is_none());
    }
}
