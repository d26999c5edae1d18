//! Leader-Side Replication
//!
//! Pushes each freshly minted block to every other registered member. Pushes
//! run concurrently in a detached task; nothing is retried inline, since
//! periodic reconciliation repairs followers that missed a block.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{PeerTransport, ReplicationConfig, SyncOutcome};
use crate::coordination::CoordinationClient;
use crate::ledger::{Block, BlockIndex};

/// Outcome of replicating one block
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplicationReport {
    /// Block that was pushed
    pub block_index: BlockIndex,
    /// Followers that accepted it
    pub success_count: usize,
    /// Followers it was offered to
    pub total_followers: usize,
    /// `(peer, reason)` for each push that did not succeed
    pub failures: Vec<(String, String)>,
}

/// Replication counters
#[derive(Debug, Default)]
pub struct ReplicationStats {
    rounds: AtomicU64,
    pushes_ok: AtomicU64,
    pushes_rejected: AtomicU64,
    pushes_failed: AtomicU64,
}

/// Point-in-time copy of `ReplicationStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub rounds: u64,
    pub pushes_ok: u64,
    pub pushes_rejected: u64,
    pub pushes_failed: u64,
}

impl ReplicationStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rounds: self.rounds.load(Ordering::Relaxed),
            pushes_ok: self.pushes_ok.load(Ordering::Relaxed),
            pushes_rejected: self.pushes_rejected.load(Ordering::Relaxed),
            pushes_failed: self.pushes_failed.load(Ordering::Relaxed),
        }
    }
}

/// Fans minted blocks out to followers
pub struct Replicator {
    /// This node's address, excluded from targets
    self_address: String,
    /// Source of the member list
    coordination: Arc<CoordinationClient>,
    /// How blocks reach peers
    transport: Arc<dyn PeerTransport>,
    /// Timing
    config: ReplicationConfig,
    /// Counters
    stats: ReplicationStats,
}

impl Replicator {
    pub fn new(
        self_address: String,
        coordination: Arc<CoordinationClient>,
        transport: Arc<dyn PeerTransport>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            self_address,
            coordination,
            transport,
            config,
            stats: ReplicationStats::default(),
        }
    }

    /// Counters so far
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Replicate `block` in the background.
    ///
    /// The report is only available through the returned handle.
    pub fn dispatch(self: &Arc<Self>, block: Block) -> JoinHandle<ReplicationReport> {
        let replicator = Arc::clone(self);
        tokio::spawn(async move { replicator.replicate(block).await })
    }

    /// Push `block` to every other registered member
    pub async fn replicate(&self, block: Block) -> ReplicationReport {
        tokio::time::sleep(self.config.settle_delay()).await;
        self.stats.rounds.fetch_add(1, Ordering::Relaxed);

        let mut report = ReplicationReport {
            block_index: block.index,
            ..ReplicationReport::default()
        };

        let followers: Vec<String> = match self.coordination.list_active_members().await {
            Ok(members) => members.into_iter().filter(|m| *m != self.self_address).collect(),
            Err(e) => {
                tracing::warn!("Cannot replicate block {}: member list unavailable: {}", block.index, e);
                report.failures.push(("membership".to_string(), e.to_string()));
                return report;
            }
        };
        report.total_followers = followers.len();

        if followers.is_empty() {
            tracing::debug!("Block {} has no followers to reach", block.index);
            return report;
        }

        let push_timeout = self.config.push_timeout();
        let pushes = followers.iter().map(|peer| {
            let block = &block;
            async move {
                let result = timeout(push_timeout, self.transport.push_block(peer, block)).await;
                (peer.clone(), result)
            }
        });

        for (peer, result) in join_all(pushes).await {
            match result {
                Ok(Ok(SyncOutcome::Accepted)) => {
                    self.stats.pushes_ok.fetch_add(1, Ordering::Relaxed);
                    report.success_count += 1;
                }
                Ok(Ok(SyncOutcome::Rejected(reason))) => {
                    self.stats.pushes_rejected.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Peer {} rejected block {}: {}", peer, block.index, reason);
                    report.failures.push((peer, reason.to_string()));
                }
                Ok(Err(e)) => {
                    self.stats.pushes_failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Push of block {} to {} failed: {}", block.index, peer, e);
                    report.failures.push((peer, e.to_string()));
                }
                Err(_) => {
                    self.stats.pushes_failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Push of block {} to {} timed out", block.index, peer);
                    report.failures.push((peer, "timed out".to_string()));
                }
            }
        }

        tracing::info!(
            "Block {} replicated to {}/{} followers",
            block.index,
            report.success_count,
            report.total_followers
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{ClientConfig, ConnectionState, CoordinationBackend, CreateMode, MemoryBackend};
    use crate::error::{Error, Result, ValidationError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Scripted peers keyed by address
    struct ScriptedTransport {
        answers: HashMap<String, Option<SyncOutcome>>,
        hang: Vec<String>,
    }

    #[async_trait]
    impl PeerTransport for ScriptedTransport {
        async fn push_block(&self, peer: &str, _block: &Block) -> Result<SyncOutcome> {
            if self.hang.iter().any(|p| p == peer) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            match self.answers.get(peer) {
                Some(Some(outcome)) => Ok(outcome.clone()),
                _ => Err(Error::ConnectionFailed {
                    address: peer.to_string(),
                    reason: "refused".into(),
                }),
            }
        }

        async fn fetch_chain(&self, _peer: &str) -> Result<Vec<Block>> {
            Ok(vec![Block::genesis()])
        }
    }

    async fn registered_client(backend: &Arc<MemoryBackend>, members: &[&str]) -> Arc<CoordinationClient> {
        let session = backend.open_session(Duration::from_secs(60)).await.unwrap();
        for member in members {
            backend
                .create(session, &format!("/r/nodes/{}", member), Vec::new(), CreateMode::Ephemeral)
                .await
                .unwrap();
        }
        let config = ClientConfig {
            root: "/r".into(),
            ..ClientConfig::default()
        };
        let client = CoordinationClient::new("leader:1".into(), backend.clone(), config);
        client.force_state(ConnectionState::Connected(session));
        Arc::new(client)
    }

    fn config() -> ReplicationConfig {
        ReplicationConfig {
            settle_delay_ms: 0,
            push_timeout_ms: 100,
        }
    }

    #[tokio::test]
    async fn test_report_counts_each_outcome() {
        let backend = Arc::new(MemoryBackend::new());
        let client = registered_client(&backend, &["leader:1", "ok:2", "dup:3", "down:4", "slow:5"]).await;

        let mut answers = HashMap::new();
        answers.insert("ok:2".to_string(), Some(SyncOutcome::Accepted));
        answers.insert(
            "dup:3".to_string(),
            Some(SyncOutcome::Rejected(ValidationError::Duplicate { hash: "x".into() })),
        );
        answers.insert("slow:5".to_string(), Some(SyncOutcome::Accepted));
        let transport = Arc::new(ScriptedTransport {
            answers,
            hang: vec!["slow:5".to_string()],
        });

        let replicator = Arc::new(Replicator::new("leader:1".into(), client, transport, config()));
        let report = replicator.dispatch(Block::genesis()).await.unwrap();

        assert_eq!(report.total_followers, 4);
        assert_eq!(report.success_count, 1);
        assert_eq!(report.failures.len(), 3);
        assert!(report.failures.iter().all(|(peer, _)| peer != "leader:1"));

        let stats = replicator.stats();
        assert_eq!(stats.rounds, 1);
        assert_eq!(stats.pushes_ok, 1);
        assert_eq!(stats.pushes_rejected, 1);
        assert_eq!(stats.pushes_failed, 2);
    }

    #[tokio::test]
    async fn test_lone_leader_has_no_followers() {
        let backend = Arc::new(MemoryBackend::new());
        let client = registered_client(&backend, &["leader:1"]).await;
        let transport = Arc::new(ScriptedTransport {
            answers: HashMap::new(),
            hang: Vec::new(),
        });

        let replicator = Arc::new(Replicator::new("leader:1".into(), client, transport, config()));
        let report = replicator.replicate(Block::genesis()).await;

        assert_eq!(report.total_followers, 0);
        assert_eq!(report.success_count, 0);
        assert!(report.failures.is_empty());
    }
}
