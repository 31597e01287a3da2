//! Agent configuration.

use anyhow::{bail, Context, Result};
use cadcollab_core::{SessionSettings, UserProfile};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Node identifier, used as the fan-out origin
    pub node_id: Option<Uuid>,

    /// Client gateway configuration
    pub gateway: GatewayConfig,

    /// Fan-out configuration
    pub fanout: FanOutConfig,

    /// Auth and document store configuration
    pub collaborators: CollaboratorConfig,

    /// Session persistence configuration
    pub persistence: PersistenceConfig,

    /// Session tunables
    pub session: SessionSettings,
}

/// WebSocket gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to bind to
    pub bind_addr: String,
}

/// Which fan-out fabric to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOutKind {
    /// In-process hub; a single node
    Local,
    /// Shared MQTT broker
    Mqtt,
}

/// Fan-out configuration.
#[derive(Debug, Clone)]
pub struct FanOutConfig {
    /// Fabric
    pub kind: FanOutKind,

    /// MQTT broker URL
    pub mqtt_broker: String,

    /// Tenant identifier
    pub tenant: String,
}

/// Where the auth and document store collaborators live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollaboratorKind {
    /// Static token table and an in-memory store
    Memory,
    /// REST backend
    Http,
}

/// Collaborator configuration.
#[derive(Debug, Clone)]
pub struct CollaboratorConfig {
    /// Backend kind
    pub kind: CollaboratorKind,

    /// REST backend URL
    pub backend_url: String,

    /// Service bearer token for the backend
    pub backend_token: Option<String>,

    /// Token table for the memory authenticator
    pub tokens: HashMap<String, UserProfile>,
}

/// Where session snapshots go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceKind {
    /// Local `SQLite` file
    Sqlite,
    /// The REST backend
    Http,
    /// Kept in memory only
    Memory,
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Store kind
    pub store_type: PersistenceKind,

    /// Database path (for `SQLite`)
    pub db_path: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            gateway: GatewayConfig {
                bind_addr: "127.0.0.1:9200".to_string(),
            },
            fanout: FanOutConfig {
                kind: FanOutKind::Local,
                mqtt_broker: "tcp://localhost:1883".to_string(),
                tenant: "default".to_string(),
            },
            collaborators: CollaboratorConfig {
                kind: CollaboratorKind::Memory,
                backend_url: "http://localhost:8080".to_string(),
                backend_token: None,
                tokens: HashMap::new(),
            },
            persistence: PersistenceConfig {
                store_type: PersistenceKind::Sqlite,
                db_path: PathBuf::from("./cadcollab.db"),
            },
            session: SessionSettings::default(),
        }
    }
}

impl FromStr for FanOutKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Self::Local),
            "mqtt" => Ok(Self::Mqtt),
            other => bail!("unknown fan-out '{other}', expected 'local' or 'mqtt'"),
        }
    }
}

impl FromStr for CollaboratorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "memory" => Ok(Self::Memory),
            "http" => Ok(Self::Http),
            other => bail!("unknown collaborators '{other}', expected 'memory' or 'http'"),
        }
    }
}

impl FromStr for PersistenceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sqlite" => Ok(Self::Sqlite),
            "http" => Ok(Self::Http),
            "memory" => Ok(Self::Memory),
            other => bail!("unknown persistence '{other}', expected 'sqlite', 'http' or 'memory'"),
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `CADCOLLAB_NODE_ID`: Node UUID
    /// - `CADCOLLAB_BIND_ADDR`: Gateway bind address
    /// - `CADCOLLAB_FANOUT`: "local" or "mqtt"
    /// - `CADCOLLAB_MQTT_BROKER`: MQTT broker URL
    /// - `CADCOLLAB_TENANT`: Tenant identifier
    /// - `CADCOLLAB_COLLABORATORS`: "memory" or "http"
    /// - `CADCOLLAB_BACKEND_URL`, `CADCOLLAB_BACKEND_TOKEN`: REST backend
    /// - `CADCOLLAB_TOKENS`: JSON token table for the memory authenticator
    /// - `CADCOLLAB_PERSISTENCE`: "sqlite", "http" or "memory"
    /// - `CADCOLLAB_DB_PATH`: `SQLite` database path
    /// - `CADCOLLAB_LOCK_TIMEOUT_SECS`, `CADCOLLAB_HEARTBEAT_SECS`,
    ///   `CADCOLLAB_CONFLICT_WINDOW_MS`, `CADCOLLAB_CONFLICT_TIMEOUT_SECS`,
    ///   `CADCOLLAB_LOG_CAPACITY`, `CADCOLLAB_HISTORY_ON_JOIN`,
    ///   `CADCOLLAB_QUEUE_CAPACITY`, `CADCOLLAB_AUTOSAVE_SECS`: session tunables
    ///
    /// # Errors
    ///
    /// Returns error if a variable holds an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns error if a variable holds an invalid value.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(id) = var("CADCOLLAB_NODE_ID") {
            config.node_id = Some(Uuid::parse_str(&id).context("Invalid CADCOLLAB_NODE_ID")?);
        }

        if let Some(addr) = var("CADCOLLAB_BIND_ADDR") {
            config.gateway.bind_addr = addr;
        }

        if let Some(kind) = var("CADCOLLAB_FANOUT") {
            config.fanout.kind = kind.parse().context("Invalid CADCOLLAB_FANOUT")?;
        }

        if let Some(mqtt) = var("CADCOLLAB_MQTT_BROKER") {
            config.fanout.mqtt_broker = mqtt;
        }

        if let Some(tenant) = var("CADCOLLAB_TENANT") {
            config.fanout.tenant = tenant;
        }

        if let Some(kind) = var("CADCOLLAB_COLLABORATORS") {
            config.collaborators.kind = kind.parse().context("Invalid CADCOLLAB_COLLABORATORS")?;
        }

        if let Some(url) = var("CADCOLLAB_BACKEND_URL") {
            config.collaborators.backend_url = url;
        }

        if let Some(token) = var("CADCOLLAB_BACKEND_TOKEN") {
            config.collaborators.backend_token = Some(token);
        }

        if let Some(tokens) = var("CADCOLLAB_TOKENS") {
            config.collaborators.tokens =
                serde_json::from_str(&tokens).context("Invalid CADCOLLAB_TOKENS JSON")?;
        }

        if let Some(kind) = var("CADCOLLAB_PERSISTENCE") {
            config.persistence.store_type = kind.parse().context("Invalid CADCOLLAB_PERSISTENCE")?;
        }

        if let Some(db_path) = var("CADCOLLAB_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        let session = &mut config.session;
        if let Some(secs) = number(&var, "CADCOLLAB_LOCK_TIMEOUT_SECS")? {
            session.lock_timeout_ms = secs.saturating_mul(1000);
        }
        if let Some(secs) = number(&var, "CADCOLLAB_HEARTBEAT_SECS")? {
            session.heartbeat_interval_ms = secs.saturating_mul(1000);
        }
        if let Some(ms) = number(&var, "CADCOLLAB_CONFLICT_WINDOW_MS")? {
            session.conflict_window_ms = ms;
        }
        if let Some(secs) = number(&var, "CADCOLLAB_CONFLICT_TIMEOUT_SECS")? {
            session.conflict_timeout_ms = secs.saturating_mul(1000);
        }
        if let Some(n) = number(&var, "CADCOLLAB_LOG_CAPACITY")? {
            session.log_capacity = usize::try_from(n).context("CADCOLLAB_LOG_CAPACITY too large")?;
        }
        if let Some(n) = number(&var, "CADCOLLAB_HISTORY_ON_JOIN")? {
            session.history_on_join =
                usize::try_from(n).context("CADCOLLAB_HISTORY_ON_JOIN too large")?;
        }
        if let Some(n) = number(&var, "CADCOLLAB_QUEUE_CAPACITY")? {
            session.queue_capacity =
                usize::try_from(n).context("CADCOLLAB_QUEUE_CAPACITY too large")?;
        }
        if let Some(secs) = number(&var, "CADCOLLAB_AUTOSAVE_SECS")? {
            session.autosave_interval_ms = secs.saturating_mul(1000);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let session = &self.session;
        if session.heartbeat_interval_ms == 0 {
            bail!("CADCOLLAB_HEARTBEAT_SECS must be positive");
        }
        if session.autosave_interval_ms == 0 {
            bail!("CADCOLLAB_AUTOSAVE_SECS must be positive");
        }
        if session.queue_capacity == 0 {
            bail!("CADCOLLAB_QUEUE_CAPACITY must be positive");
        }
        Ok(())
    }
}

fn number(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    var(key)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .with_context(|| format!("Invalid {key}: '{raw}'"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadcollab_core::Role;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        let config = AgentConfig::from_vars(vars(&[])).unwrap();
        assert_eq!(config.gateway.bind_addr, "127.0.0.1:9200");
        assert_eq!(config.fanout.kind, FanOutKind::Local);
        assert_eq!(config.collaborators.kind, CollaboratorKind::Memory);
        assert_eq!(config.persistence.store_type, PersistenceKind::Sqlite);
        assert_eq!(config.session, SessionSettings::default());
    }

    #[test]
    fn overrides_from_variables() {
        let config = AgentConfig::from_vars(vars(&[
            ("CADCOLLAB_FANOUT", "mqtt"),
            ("CADCOLLAB_MQTT_BROKER", "mqtt://broker:1884"),
            ("CADCOLLAB_TENANT", "acme"),
            ("CADCOLLAB_PERSISTENCE", "memory"),
            ("CADCOLLAB_LOCK_TIMEOUT_SECS", "60"),
            ("CADCOLLAB_CONFLICT_WINDOW_MS", "2500"),
            (
                "CADCOLLAB_TOKENS",
                r#"{"t-alice":{"id":"alice","name":"Alice","role":"editor"}}"#,
            ),
        ]))
        .unwrap();

        assert_eq!(config.fanout.kind, FanOutKind::Mqtt);
        assert_eq!(config.fanout.mqtt_broker, "mqtt://broker:1884");
        assert_eq!(config.fanout.tenant, "acme");
        assert_eq!(config.persistence.store_type, PersistenceKind::Memory);
        assert_eq!(config.session.lock_timeout_ms, 60_000);
        assert_eq!(config.session.conflict_window_ms, 2_500);
        assert_eq!(config.collaborators.tokens["t-alice"].role, Role::Editor);
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = AgentConfig::from_vars(vars(&[("CADCOLLAB_HEARTBEAT_SECS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("CADCOLLAB_HEARTBEAT_SECS"));

        assert!(AgentConfig::from_vars(vars(&[("CADCOLLAB_FANOUT", "redis")])).is_err());
        assert!(AgentConfig::from_vars(vars(&[("CADCOLLAB_NODE_ID", "node-1")])).is_err());
        assert!(AgentConfig::from_vars(vars(&[("CADCOLLAB_QUEUE_CAPACITY", "0")])).is_err());
    }
}
