//! Common error types for ShardChat
//!
//! This module defines all error types used across the ShardChat system.
//! Request-validation errors are reported before any generation starts;
//! everything else is a terminal failure of an in-flight request.

use thiserror::Error;

/// Main error type for ShardChat
#[derive(Error, Debug)]
pub enum ShardChatError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid request parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Malformed turn history
    #[error("Invalid conversation: {0}")]
    InvalidConversation(String),

    /// Malformed conversation template
    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    /// Shards produced different outputs under the same seed
    #[error("Shard desync: {0}")]
    ShardDesync(String),

    /// A shard stalled past its deadline
    #[error("Worker timed out: {0}")]
    WorkerTimeout(String),

    /// The model capability failed during a forward pass
    #[error("Model failure: {0}")]
    ModelFailure(String),

    /// Worker pool is gone or could not be started
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShardChatError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ShardChatError::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        ShardChatError::InvalidInput(msg.into())
    }

    /// Create an invalid conversation error
    pub fn invalid_conversation(msg: impl Into<String>) -> Self {
        ShardChatError::InvalidConversation(msg.into())
    }

    /// Create an invalid template error
    pub fn invalid_template(msg: impl Into<String>) -> Self {
        ShardChatError::InvalidTemplate(msg.into())
    }

    /// Create a shard desync error
    pub fn shard_desync(msg: impl Into<String>) -> Self {
        ShardChatError::ShardDesync(msg.into())
    }

    /// Create a worker timeout error
    pub fn worker_timeout(msg: impl Into<String>) -> Self {
        ShardChatError::WorkerTimeout(msg.into())
    }

    /// Create a model failure error
    pub fn model_failure(msg: impl Into<String>) -> Self {
        ShardChatError::ModelFailure(msg.into())
    }

    /// Create a worker unavailable error
    pub fn worker_unavailable(msg: impl Into<String>) -> Self {
        ShardChatError::WorkerUnavailable(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        ShardChatError::Internal(msg.into())
    }

    /// True for errors caused by the request itself rather than the workers.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ShardChatError::InvalidInput(_)
                | ShardChatError::InvalidConversation(_)
                | ShardChatError::InvalidTemplate(_)
        )
    }
}

impl From<anyhow::Error> for ShardChatError {
    fn from(err: anyhow::Error) -> Self {
        ShardChatError::ModelFailure(format!("{:#}", err))
    }
}

/// Result type alias for ShardChat operations
pub type Result<T> = std::result::Result<T, ShardChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_classification() {
        assert!(ShardChatError::invalid_conversation("empty").is_client_error());
        assert!(ShardChatError::invalid_template("no sep2").is_client_error());
        assert!(!ShardChatError::worker_timeout("rank 1").is_client_error());
        assert!(!ShardChatError::shard_desync("rank 1").is_client_error());
    }

    #[test]
    fn test_opaque_errors_become_model_failures() {
        let err: ShardChatError = anyhow::anyhow!("cuda out of memory").into();
        assert!(matches!(err, ShardChatError::ModelFailure(ref m) if m.contains("out of memory")));
    }
}
