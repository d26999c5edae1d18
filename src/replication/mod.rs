//! Replication Module
//!
//! Leader-side fan-out of freshly minted blocks and follower-side intake.

pub mod protocol;
mod leader;
mod follower;

pub use protocol::{SyncOutcome, SyncRequest, SyncResponse};
pub use leader::{Replicator, ReplicationReport, ReplicationStats, StatsSnapshot};
pub use follower::BlockIntake;

use std::time::Duration;

use crate::ledger::Block;

/// Configuration for replication
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Pause before pushing, so very recent joins are registered
    pub settle_delay_ms: u64,
    /// Per-peer push timeout in milliseconds
    pub push_timeout_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 500,
            push_timeout_ms: 3000,
        }
    }
}

impl ReplicationConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }
}

/// How a node reaches its peers
#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync {
    /// Offer a block to a follower
    async fn push_block(&self, peer: &str, block: &Block) -> crate::Result<SyncOutcome>;

    /// Fetch a peer's full chain in order
    async fn fetch_chain(&self, peer: &str) -> crate::Result<Vec<Block>>;
}
