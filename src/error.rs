//! Notary Error Types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for notary operations
pub type Result<T> = std::result::Result<T, Error>;

/// Reasons a block or candidate chain is refused.
///
/// These always leave the local chain untouched and travel back to the
/// sender of a push as the rejection reason.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("index mismatch: expected {expected}, received {received}")]
    IndexMismatch { expected: u64, received: u64 },

    #[error("previous hash mismatch: expected {expected}, received {received}")]
    PrevHashMismatch { expected: String, received: String },

    #[error("hash of block {index} does not match its contents")]
    HashInvalid { index: u64 },

    #[error("block {hash} is already in the chain")]
    Duplicate { hash: String },

    #[error("candidate chain is not longer ({candidate} <= {local})")]
    NotLonger { local: usize, candidate: usize },

    #[error("candidate chain is invalid")]
    Invalid,

    #[error("malformed block representation: {detail}")]
    Malformed { detail: String },
}

/// Notary error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Ledger errors
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    // Role errors
    #[error("Leader required (current leader: {})", .leader.as_deref().unwrap_or("unknown"))]
    LeaderRequired { leader: Option<String> },

    // Coordination errors
    #[error("Not connected to the coordination service")]
    NotConnected,

    #[error("Coordination session expired")]
    SessionExpired,

    #[error("Coordination entry already exists: {0}")]
    NodeExists(String),

    #[error("Coordination entry not found: {0}")]
    NoNode(String),

    #[error("Coordination error: {0}")]
    Coordination(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // Serialization errors
    #[error("Wire serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotConnected
                | Error::SessionExpired
                | Error::Network(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::Http(_)
                | Error::Io(_)
        )
    }

    /// Check if this error means the coordination session is gone
    pub fn is_session_loss(&self) -> bool {
        matches!(self, Error::SessionExpired | Error::NotConnected)
    }
}
