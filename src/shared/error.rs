//! Shared Error Types
//!
//! The error taxonomy the whole engine is built around. Submission failures
//! fall into three classes with distinct handling:
//!
//! - `Transient` - network faults, timeouts, 5xx responses; retried with
//!   bounded exponential backoff
//! - `Conflict` - the server detected that the target entity changed under
//!   the client's assumed base state; never auto-retried, surfaced for a
//!   user decision
//! - `Validation` - permanently rejected payloads; never retried
//!
//! `Storage` and `Serialization` wrap local faults (SQLite, JSON) and are
//! not submission outcomes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors shared between the client engine and the backend server
#[derive(Debug, Error)]
pub enum SyncError {
    /// Retryable failure (network, timeout, server 5xx)
    #[error("transient error: {message}")]
    Transient {
        /// Human-readable error message
        message: String,
    },

    /// The target entity was modified by someone else since the client's
    /// assumed base state
    #[error("conflict: {message}")]
    Conflict {
        /// Human-readable error message
        message: String,
    },

    /// Permanently rejected payload
    #[error("validation error: {message}")]
    Validation {
        /// Human-readable error message
        message: String,
    },

    /// Local or server database error
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// JSON serialization or deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Create a new transient error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Create a new conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Whether the drainer may retry the operation that produced this error
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Stable kind string used in wire error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "transient",
            Self::Conflict { .. } => "conflict",
            Self::Validation { .. } => "validation",
            Self::Storage(_) => "storage",
            Self::Serialization(_) => "serialization",
        }
    }
}

/// JSON error body exchanged over HTTP
///
/// The backend serializes failed submissions into this shape; the HTTP
/// transport maps it (together with the status code) back onto [`SyncError`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    /// One of the [`SyncError::kind`] strings
    pub kind: String,
    /// Human-readable error message
    pub message: String,
}

impl From<&SyncError> for WireError {
    fn from(err: &SyncError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}
