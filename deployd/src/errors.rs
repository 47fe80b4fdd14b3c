//! Error types for deployd

use thiserror::Error;

/// Main error type for deployd
#[derive(Error, Debug)]
pub enum DeploydError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Malformed payload, unknown host, out-of-turn report
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The replica serving the request has not caught up yet
    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The command is not allowed in the job's current status
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Timed out: {0}")]
    TimedOut(String),

    #[error("Install error: {0}")]
    InstallError(String),

    #[error("Rollout error: {0}")]
    RolloutError(String),

    #[error("Archive error: {0}")]
    ArchiveError(String),

    #[error("Supervisor error: {0}")]
    SupervisorError(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeploydError {
    /// Whether the caller should ask again shortly
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeploydError::NotReady(_))
    }

    /// Whether the failure came from cooperative cancellation
    pub fn is_cancellation(&self) -> bool {
        matches!(self, DeploydError::Cancelled(_) | DeploydError::TimedOut(_))
    }
}

impl From<anyhow::Error> for DeploydError {
    fn from(err: anyhow::Error) -> Self {
        DeploydError::Internal(err.to_string())
    }
}
