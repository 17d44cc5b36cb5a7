//! HTTP client for the session store.
//!
//! Routes:
//! - `GET    {base}/scopes/{scope}/sessions`
//! - `POST   {base}/sessions`
//! - `GET    {base}/sessions/{id}`
//! - `GET    {base}/sessions/{id}/history`
//! - `DELETE {base}/sessions/{id}`

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;

use super::{Persistence, PersistenceError, PersistenceResult};
use crate::assembler::StreamingUnit;
use crate::session::{Session, SessionSpec};

/// Longest error body excerpt kept in an error message.
const MAX_ERROR_BODY: usize = 200;

/// JSON-over-HTTP [`Persistence`] backend.
#[derive(Debug, Clone)]
pub struct HttpPersistence {
    base_url: String,
    client: Client,
}

impl HttpPersistence {
    /// Creates a client for `base_url` with a per-request timeout.
    pub fn new(base_url: &str, request_timeout: Duration) -> PersistenceResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PersistenceError::Http(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// The normalized base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Maps a response to a decoded body. 404 becomes `NotFound(resource)`.
    async fn decode<T: DeserializeOwned>(response: Response, resource: &str) -> PersistenceResult<T> {
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| PersistenceError::Http(e.to_string()))?;

        if status == StatusCode::NOT_FOUND {
            return Err(PersistenceError::NotFound(resource.to_string()));
        }
        if !status.is_success() {
            let raw = String::from_utf8_lossy(&body);
            let excerpt: String = raw.chars().take(MAX_ERROR_BODY).collect();
            tracing::warn!(status = %status, resource = %resource, "Persistence request failed");
            return Err(PersistenceError::Http(format!("{}: {}", status, excerpt)));
        }

        serde_json::from_slice(&body).map_err(|e| {
            tracing::warn!(error = %e, resource = %resource, "Failed to decode persistence response");
            PersistenceError::Decode(e.to_string())
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, resource: &str) -> PersistenceResult<T> {
        let url = self.url(path);
        tracing::debug!(url = %url, "GET");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PersistenceError::Http(e.to_string()))?;
        Self::decode(response, resource).await
    }
}

impl Persistence for HttpPersistence {
    fn list_sessions(
        &self,
        scope_id: &str,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = PersistenceResult<Vec<Session>>> + Send + '_>,
    > {
        let scope_id = scope_id.to_string();
        Box::pin(async move {
            self.get_json(&format!("/scopes/{}/sessions", scope_id), &scope_id)
                .await
        })
    }

    fn create_session(
        &self,
        spec: &SessionSpec,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = PersistenceResult<Session>> + Send + '_>>
    {
        let spec = spec.clone();
        Box::pin(async move {
            let url = self.url("/sessions");
            let resource = spec.id.clone().unwrap_or_default();
            tracing::debug!(url = %url, session_id = %resource, "POST");
            let response = self
                .client
                .post(&url)
                .json(&spec)
                .send()
                .await
                .map_err(|e| PersistenceError::Http(e.to_string()))?;
            Self::decode(response, &resource).await
        })
    }

    fn get_session(
        &self,
        id: &str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = PersistenceResult<Session>> + Send + '_>>
    {
        let id = id.to_string();
        Box::pin(async move { self.get_json(&format!("/sessions/{}", id), &id).await })
    }

    fn get_history(
        &self,
        id: &str,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = PersistenceResult<Vec<StreamingUnit>>> + Send + '_>,
    > {
        let id = id.to_string();
        Box::pin(async move {
            self.get_json(&format!("/sessions/{}/history", id), &id)
                .await
        })
    }

    fn delete_session(
        &self,
        id: &str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = PersistenceResult<()>> + Send + '_>>
    {
        let id = id.to_string();
        Box::pin(async move {
            let url = self.url(&format!("/sessions/{}", id));
            tracing::debug!(url = %url, "DELETE");
            let response = self
                .client
                .delete(&url)
                .send()
                .await
                .map_err(|e| PersistenceError::Http(e.to_string()))?;

            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                return Err(PersistenceError::NotFound(id));
            }
            if !status.is_success() {
                return Err(PersistenceError::Http(status.to_string()));
            }
            Ok(())
        })
    }
}
