//! Error types for the request desk HTTP client.

use requestdesk_core::SyncError;
use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur while talking to the request desk backend.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API error response from the backend
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Invalid request (empty endpoint, etc.)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Event stream failure
    #[error("Event stream error: {0}")]
    Stream(String),
}

impl ClientError {
    /// Create an API error from status and message
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream(message.into())
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn into_fetch_error(self) -> SyncError {
        SyncError::fetch(self.to_string())
    }

    pub fn into_mutation_error(self) -> SyncError {
        SyncError::mutation(self.to_string())
    }

    pub fn into_push_error(self) -> SyncError {
        SyncError::push(self.to_string())
    }
}
