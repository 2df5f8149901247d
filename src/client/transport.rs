//! # Sync Transport
//!
//! Abstraction over how the client reaches the server. The engine only ever
//! talks through [`SyncTransport`], so tests drive a full client/server pair
//! in one process while production uses the HTTP implementation.
//!
//! The HTTP transport is also where wire failures are classified into the
//! engine's error taxonomy: connection faults and 5xx responses become
//! transient, 409 becomes a conflict, 400/422 become validation failures.

use crate::shared::delta::{DeltaRequest, DeltaResult};
use crate::shared::error::WireError;
use crate::shared::mutation::{SubmitMutationRequest, SubmitMutationResponse};
use crate::shared::SyncError;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

/// Channel the client engine submits mutations and pulls deltas through
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Submit one mutation for server-side application
    async fn submit(
        &self,
        request: &SubmitMutationRequest,
    ) -> Result<SubmitMutationResponse, SyncError>;

    /// Pull changes since the request's checkpoint
    async fn pull(&self, request: &DeltaRequest) -> Result<DeltaResult, SyncError>;
}

/// HTTP transport against the backend's REST API
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a transport for the given base URL (no trailing slash)
    pub fn new(base_url: impl Into<String>) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SyncError::transient(format!("build http client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Map an HTTP failure status and its body onto the error taxonomy
    fn classify(status: StatusCode, body: &str) -> SyncError {
        let message = serde_json::from_str::<WireError>(body)
            .map(|w| w.message)
            .unwrap_or_else(|_| {
                if body.is_empty() {
                    format!("http status {}", status)
                } else {
                    body.to_string()
                }
            });

        match status {
            StatusCode::CONFLICT => SyncError::conflict(message),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                SyncError::validation(message)
            }
            _ => SyncError::transient(message),
        }
    }

    async fn handle_failure(response: reqwest::Response) -> SyncError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Self::classify(status, &body)
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn submit(
        &self,
        request: &SubmitMutationRequest,
    ) -> Result<SubmitMutationResponse, SyncError> {
        let url = format!(
            "{}/api/workspaces/{}/mutations",
            self.base_url, request.workspace_id
        );

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| SyncError::transient(format!("submit: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::handle_failure(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| SyncError::transient(format!("submit response body: {}", e)))
    }

    async fn pull(&self, request: &DeltaRequest) -> Result<DeltaResult, SyncError> {
        let url = format!(
            "{}/api/workspaces/{}/delta",
            self.base_url, request.workspace_id
        );

        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(since) = &request.modified_since {
            query.push(("modified_since", since.clone()));
        }
        if !request.entity_types.is_empty() {
            let types = request
                .entity_types
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(",");
            query.push(("entity_types", types));
        }
        if let Some(limit) = request.limit {
            query.push(("limit", limit.to_string()));
        }
        if let Some(after_id) = &request.after_id {
            query.push(("after_id", after_id.clone()));
        }

        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| SyncError::transient(format!("delta pull: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::handle_failure(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| SyncError::transient(format!("delta response body: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_conflict_status_maps_to_conflict() {
        let body = r#"{"kind":"conflict","message":"entity changed on server"}"#;
        let error = HttpTransport::classify(StatusCode::CONFLICT, body);
        assert!(matches!(error, SyncError::Conflict { .. }));
        assert!(error.to_string().contains("entity changed on server"));
    }

    #[test]
    fn test_validation_statuses_map_to_validation() {
        for status in [StatusCode::BAD_REQUEST, StatusCode::UNPROCESSABLE_ENTITY] {
            let error = HttpTransport::classify(status, "");
            assert!(matches!(error, SyncError::Validation { .. }));
        }
    }

    #[test]
    fn test_server_errors_map_to_transient() {
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            let error = HttpTransport::classify(status, "");
            assert!(error.is_transient(), "{} should be transient", status);
        }
    }

    #[test]
    fn test_classify_reads_wire_error_message() {
        let body = r#"{"kind":"validation","message":"name must not be empty"}"#;
        let error = HttpTransport::classify(StatusCode::UNPROCESSABLE_ENTITY, body);
        assert_eq!(
            error.to_string(),
            "validation error: name must not be empty"
        );
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let transport = HttpTransport::new("http://localhost:3000/").unwrap();
        assert_eq!(transport.base_url, "http://localhost:3000");
    }
}
