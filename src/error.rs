//! Error types for the Gatekeeper engine.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Invalid rule or service configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The distributed store rejected a command or could not be reached
    #[error("Storage error: {0}")]
    Storage(#[from] redis::RedisError),

    /// The distributed store answered with something we cannot interpret
    #[error("Malformed storage response: {0}")]
    MalformedResponse(String),

    /// A store command did not complete before its deadline
    #[error("Storage operation timed out after {0:?}")]
    Timeout(Duration),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatekeeperError {
    /// Whether the error came from the backing store rather than configuration.
    ///
    /// Callers use this to decide between failing open and failing closed.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            GatekeeperError::Storage(_)
                | GatekeeperError::MalformedResponse(_)
                | GatekeeperError::Timeout(_)
        )
    }
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
