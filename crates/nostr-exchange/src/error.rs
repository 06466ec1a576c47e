//! Exchange error types

use std::time::Duration;
use thiserror::Error;

/// Exchange error type
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// Event failed local validation
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// Decryption collaborator could not open a payload
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// No matching reply arrived before the deadline
    #[error("No reply within {after:?}")]
    Timeout { after: Duration },

    /// Session was cancelled before it resolved
    #[error("Exchange cancelled")]
    Cancelled,

    /// No signing identity is configured
    #[error("Signing unavailable: {0}")]
    SigningUnavailable(String),

    /// Relay rejected or failed to publish the request
    #[error("Event publish failed: {0}")]
    PublishFailed(String),

    /// Relay subscription could not be opened
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// A session result slot was written twice
    #[error("Duplicate resolution for session {0}")]
    DuplicateResolution(String),

    /// Invalid request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExchangeError {
    /// Whether this is the timeout outcome of a session.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExchangeError::Timeout { .. })
    }

    /// Whether this is the cancellation outcome of a session.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExchangeError::Cancelled)
    }
}

/// Exchange result type
pub type Result<T> = std::result::Result<T, ExchangeError>;
