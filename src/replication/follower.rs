//! Follower-Side Intake
//!
//! Validates blocks pushed by the leader and appends the ones that extend
//! the local tail.

use std::sync::Arc;

use serde_json::Value;

use super::{SyncOutcome, SyncRequest};
use crate::error::ValidationError;
use crate::ledger::{Block, Ledger};

/// Entry point for inbound block pushes
#[derive(Clone)]
pub struct BlockIntake {
    ledger: Arc<Ledger>,
}

impl BlockIntake {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    /// Offer a decoded block to the local chain
    pub async fn receive(&self, block: Block) -> SyncOutcome {
        let index = block.index;
        match self.ledger.append_replicated(block).await {
            Ok(()) => {
                tracing::debug!("Appended replicated block {}", index);
                SyncOutcome::Accepted
            }
            Err(reason) => {
                tracing::warn!("Rejected replicated block {}: {}", index, reason);
                SyncOutcome::Rejected(reason)
            }
        }
    }

    /// Offer a raw push body; anything that does not decode is `Malformed`
    pub async fn receive_value(&self, body: Value) -> SyncOutcome {
        match serde_json::from_value::<SyncRequest>(body) {
            Ok(request) => self.receive(request.block).await,
            Err(e) => {
                tracing::warn!("Rejected malformed block push: {}", e);
                SyncOutcome::Rejected(ValidationError::Malformed { detail: e.to_string() })
            }
        }
    }
}
