//! Error types for the synchronization engine.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by the engine and its collaborators.
///
/// Every variant renders as a single human-readable line, since the only
/// consumer of these errors outside the engine is the status line.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// A resource load failed (network, server or decode failure)
    #[error("Fetch failed: {0}")]
    Fetch(String),

    /// A user-initiated mutation was rejected by the server
    #[error("Mutation failed: {0}")]
    Mutation(String),

    /// The push connection failed or delivered garbage
    #[error("Push channel error: {0}")]
    Push(String),

    /// An edit was rejected locally before reaching the server
    #[error("Invalid edit: {0}")]
    InvalidEdit(String),

    /// Missing or malformed configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn fetch(message: impl Into<String>) -> Self {
        Self::Fetch(message.into())
    }

    pub fn mutation(message: impl Into<String>) -> Self {
        Self::Mutation(message.into())
    }

    pub fn push(message: impl Into<String>) -> Self {
        Self::Push(message.into())
    }

    pub fn invalid_edit(message: impl Into<String>) -> Self {
        Self::InvalidEdit(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
