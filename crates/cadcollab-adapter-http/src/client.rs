//! HTTP client for the collaborator backend.

use crate::encoding::encode_path_segment;
use async_trait::async_trait;
use cadcollab_core::{
    Authenticator, CollabError, DocumentStore, MergeOutcome, Operation, ProjectSnapshot,
    SessionPersistence, SessionState, StoreError, UserProfile,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backend client configuration.
#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    /// Base URL of the backend (e.g., <http://localhost:8080>)
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
    /// Optional service bearer token
    pub bearer_token: Option<String>,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            timeout: Duration::from_secs(10),
            bearer_token: None,
        }
    }
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    token: &'a str,
}

#[derive(Deserialize)]
struct AccessResponse {
    allowed: bool,
}

#[derive(Serialize)]
struct MergeRequest<'a> {
    operations: &'a [Operation],
}

#[derive(Deserialize)]
struct MergeResponse {
    merged: serde_json::Value,
}

/// REST implementation of every collaborator.
pub struct HttpBackend {
    client: Client,
    config: HttpBackendConfig,
}

impl HttpBackend {
    /// Create a backend client.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be created.
    pub fn new(mut config: HttpBackendConfig) -> Result<Self, ClientError> {
        let mut builder = Client::builder().timeout(config.timeout);
        if config.base_url.starts_with("https://") {
            builder = builder.use_rustls_tls();
        }
        let client = builder
            .build()
            .map_err(|e| ClientError::Init(e.to_string()))?;

        config.base_url = config.base_url.trim_end_matches('/').to_string();
        Ok(Self { client, config })
    }

    fn project_url(&self, project_id: &str, suffix: &str) -> String {
        format!(
            "{}/projects/{}{suffix}",
            self.config.base_url,
            encode_path_segment(project_id)
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ClientError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| ClientError::Request(e.to_string()))?;

        if response.status().is_success() {
            return Ok(response);
        }

        Err(ClientError::ApiError {
            status: response.status().as_u16(),
            message: response.text().await.unwrap_or_default(),
        })
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))
    }
}

#[async_trait]
impl Authenticator for HttpBackend {
    async fn authenticate(&self, token: &str) -> Result<UserProfile, CollabError> {
        let url = format!("{}/auth/verify", self.config.base_url);
        tracing::debug!(url, "POST auth verify");

        let request = self.client.post(&url).json(&VerifyRequest { token });
        self.json(request).await.map_err(|err| match err {
            ClientError::ApiError { status, .. }
                if status == StatusCode::UNAUTHORIZED.as_u16()
                    || status == StatusCode::FORBIDDEN.as_u16() =>
            {
                CollabError::Auth("invalid token".to_string())
            }
            other => CollabError::Transport(other.to_string()),
        })
    }

    async fn check_project_access(
        &self,
        user_id: &str,
        project_id: &str,
    ) -> Result<bool, CollabError> {
        let url = self.project_url(project_id, &format!("/access/{}", encode_path_segment(user_id)));
        tracing::debug!(url, "GET project access");

        match self.json::<AccessResponse>(self.client.get(&url)).await {
            Ok(access) => Ok(access.allowed),
            Err(ClientError::ApiError { status, .. })
                if status == StatusCode::FORBIDDEN.as_u16()
                    || status == StatusCode::NOT_FOUND.as_u16() =>
            {
                Ok(false)
            }
            Err(other) => Err(CollabError::Transport(other.to_string())),
        }
    }
}

#[async_trait]
impl DocumentStore for HttpBackend {
    async fn apply_operation(
        &self,
        project_id: &str,
        operation: &Operation,
    ) -> Result<(), StoreError> {
        let url = self.project_url(project_id, "/operations");
        tracing::debug!(url, operation_id = %operation.id, "POST operation");

        self.send(self.client.post(&url).json(operation))
            .await
            .map(|_| ())
            .map_err(ClientError::into_store_error)
    }

    async fn load_project(&self, project_id: &str) -> Result<ProjectSnapshot, StoreError> {
        let url = self.project_url(project_id, "");
        tracing::debug!(url, "GET project");

        self.json(self.client.get(&url))
            .await
            .map_err(ClientError::into_store_error)
    }

    async fn save_project(&self, snapshot: &ProjectSnapshot) -> Result<(), StoreError> {
        let url = self.project_url(&snapshot.project_id, "/snapshot");
        tracing::debug!(url, revision = snapshot.revision, "PUT project snapshot");

        self.send(self.client.put(&url).json(snapshot))
            .await
            .map(|_| ())
            .map_err(ClientError::into_store_error)
    }

    async fn merge_operations(
        &self,
        project_id: &str,
        operations: &[Operation],
    ) -> Result<MergeOutcome, StoreError> {
        let url = self.project_url(project_id, "/merge");
        tracing::debug!(url, operations = operations.len(), "POST merge");

        let request = self.client.post(&url).json(&MergeRequest { operations });
        match self.json::<MergeResponse>(request).await {
            Ok(response) => Ok(MergeOutcome::Merged(response.merged)),
            Err(ClientError::ApiError { status, .. })
                if status == StatusCode::UNPROCESSABLE_ENTITY.as_u16()
                    || status == StatusCode::NOT_IMPLEMENTED.as_u16() =>
            {
                Ok(MergeOutcome::Unsupported)
            }
            Err(other) => Err(other.into_store_error()),
        }
    }
}

#[async_trait]
impl SessionPersistence for HttpBackend {
    async fn persist_session_state(&self, state: &SessionState) -> Result<(), StoreError> {
        let url = self.project_url(&state.project_id, "/session");
        tracing::debug!(url, operations = state.recent_operations.len(), "PUT session state");

        self.send(self.client.put(&url).json(state))
            .await
            .map(|_| ())
            .map_err(ClientError::into_store_error)
    }
}

/// Errors that can occur with the backend client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// Client initialization failed
    #[error("client init error: {0}")]
    Init(String),
    /// HTTP request failed
    #[error("request error: {0}")]
    Request(String),
    /// API returned an error status
    #[error("API error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Error message from API
        message: String,
    },
    /// Response parsing failed
    #[error("parse error: {0}")]
    Parse(String),
}

impl ClientError {
    /// Classify for the document store contract.
    #[must_use]
    pub fn into_store_error(self) -> StoreError {
        match self {
            ClientError::ApiError { status, message } if status == 404 => {
                StoreError::NotFound(message)
            }
            ClientError::ApiError { status, message } if (400..500).contains(&status) => {
                StoreError::Rejected(format!("status {status}: {message}"))
            }
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default() {
        let config = HttpBackendConfig::default();
        assert_eq!(config.base_url, "http://localhost:8080");
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert!(config.bearer_token.is_none());
    }

    #[test]
    fn project_urls_are_encoded() {
        let backend = HttpBackend::new(HttpBackendConfig {
            base_url: "http://backend:8080/api/".to_string(),
            ..HttpBackendConfig::default()
        })
        .unwrap();

        assert_eq!(
            backend.project_url("site/a", "/operations"),
            "http://backend:8080/api/projects/site%2Fa/operations"
        );
        assert_eq!(backend.project_url("p1", ""), "http://backend:8080/api/projects/p1");
    }

    #[test]
    fn status_classification() {
        let not_found = ClientError::ApiError {
            status: 404,
            message: "gone".to_string(),
        };
        assert_eq!(not_found.into_store_error(), StoreError::NotFound("gone".to_string()));

        let conflict = ClientError::ApiError {
            status: 409,
            message: "stale".to_string(),
        };
        assert!(matches!(conflict.into_store_error(), StoreError::Rejected(_)));

        let outage = ClientError::ApiError {
            status: 503,
            message: String::new(),
        };
        assert!(matches!(outage.into_store_error(), StoreError::Unavailable(_)));
        assert!(matches!(
            ClientError::Request("refused".to_string()).into_store_error(),
            StoreError::Unavailable(_)
        ));
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_transport_error() {
        let backend = HttpBackend::new(HttpBackendConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            timeout: Duration::from_secs(2),
            bearer_token: Some("service".to_string()),
        })
        .unwrap();

        let err = backend.authenticate("token").await.unwrap_err();
        assert_eq!(err.code(), "transport_error");

        let err = backend.load_project("p1").await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
