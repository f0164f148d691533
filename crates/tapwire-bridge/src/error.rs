//! Bridge error types.

use tapwire_storage::StorageError;
use thiserror::Error;

/// Errors raised while talking to an instrumentation agent.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The agent selector could not be parsed.
    #[error("Invalid agent selector {selector:?}: {reason}")]
    InvalidSelector { selector: String, reason: String },

    /// The agent could not be reached.
    #[error("Agent connection failed: {0}")]
    Connect(#[from] std::io::Error),

    /// The agent did not answer in time.
    #[error("Agent did not respond within {0:?}")]
    Timeout(std::time::Duration),

    /// The agent sent something the bridge does not understand.
    #[error("Agent protocol error: {0}")]
    Protocol(String),

    /// The agent refused or failed the attach.
    #[error("Attach failed: {0}")]
    Attach(String),

    /// None of the candidate processes exist on the device.
    #[error("No target process available (tried {0})")]
    Unavailable(String),

    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl BridgeError {
    /// Whether the failure means the target process is missing rather than
    /// the agent misbehaving.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, BridgeError::Unavailable(_))
    }
}

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
