//! # API Error Responses
//!
//! Maps the shared error taxonomy onto HTTP. The status codes here are what
//! the client transport classifies on, so they are part of the sync
//! contract: 409 means conflict (never auto-retried), 422 means validation
//! (never retried), 5xx means the client may retry.

use crate::shared::error::WireError;
use crate::shared::SyncError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

/// HTTP-facing wrapper around [`SyncError`]
#[derive(Debug)]
pub struct ApiError(pub SyncError);

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            SyncError::Conflict { .. } => StatusCode::CONFLICT,
            SyncError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            SyncError::Transient { .. } => StatusCode::SERVICE_UNAVAILABLE,
            SyncError::Storage(_) | SyncError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        (status, Json(WireError::from(&self.0))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_maps_to_409() {
        let error = ApiError(SyncError::conflict("stale base"));
        assert_eq!(error.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_validation_maps_to_422() {
        let error = ApiError(SyncError::validation("empty name"));
        assert_eq!(error.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_transient_maps_to_503() {
        let error = ApiError(SyncError::transient("overloaded"));
        assert_eq!(error.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
