//! Replication Protocol
//!
//! JSON bodies exchanged between nodes and with clients over HTTP.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;
use crate::ledger::Block;

/// Result of offering a block to a follower
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Block appended
    Accepted,
    /// Block refused; the follower's chain is unchanged
    Rejected(ValidationError),
}

impl SyncOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SyncOutcome::Accepted)
    }
}

/// Block push from the leader (`POST /sync`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub block: Block,
}

/// Status word of a sync response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Rejected,
}

/// Follower answer to a block push
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ValidationError>,
}

impl From<SyncOutcome> for SyncResponse {
    fn from(outcome: SyncOutcome) -> Self {
        match outcome {
            SyncOutcome::Accepted => Self {
                status: SyncStatus::Synced,
                reason: None,
            },
            SyncOutcome::Rejected(reason) => Self {
                status: SyncStatus::Rejected,
                reason: Some(reason),
            },
        }
    }
}

impl SyncResponse {
    /// Turn a wire response back into an outcome
    pub fn into_outcome(self) -> SyncOutcome {
        match (self.status, self.reason) {
            (SyncStatus::Synced, _) => SyncOutcome::Accepted,
            (SyncStatus::Rejected, Some(reason)) => SyncOutcome::Rejected(reason),
            (SyncStatus::Rejected, None) => SyncOutcome::Rejected(ValidationError::Malformed {
                detail: "rejection without reason".into(),
            }),
        }
    }
}

/// Mint request (`POST /register`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintRequest {
    #[serde(default)]
    pub document: Option<Value>,
}

/// Mint response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintResponse {
    pub status: String,
    pub block: Block,
}

/// Error body returned by the HTTP API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
}
