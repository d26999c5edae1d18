//! Chain Reconciliation
//!
//! Brings a node that restarted or was partitioned up to the longest valid
//! chain held by its peers. Runs once at startup and then periodically.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;

use crate::coordination::CoordinationClient;
use crate::error::ValidationError;
use crate::ledger::{Block, Ledger};
use crate::replication::PeerTransport;
use crate::retry::{wait_until, Backoff};

/// Reconciliation timing
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Pause after connecting so peers can register
    pub settle_delay: Duration,
    /// Period of repeated runs (`None` runs only at startup)
    pub interval: Option<Duration>,
    /// Timeout for fetching one peer's chain
    pub fetch_timeout: Duration,
    /// Checks for a coordination session before giving up
    pub connect_attempts: u32,
    /// Delay between those checks
    pub connect_interval: Duration,
    /// Also consider the stored chain snapshot
    pub include_snapshot: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(3),
            interval: Some(Duration::from_secs(5)),
            fetch_timeout: Duration::from_secs(3),
            connect_attempts: 10,
            connect_interval: Duration::from_secs(1),
            include_snapshot: false,
        }
    }
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No other member is registered; local chain kept
    NoPeers,
    /// Peers exist but none answered; local chain kept
    Unreachable,
    /// Local chain replaced by the best candidate
    Adopted { source: String, length: usize },
    /// Best candidate refused; local chain kept
    Kept(ValidationError),
    /// No coordination session could be obtained
    Disconnected,
}

/// Adopts the longest valid chain found among peers
pub struct Reconciler {
    /// This node's address, excluded from sources
    self_address: String,
    /// Chain to reconcile
    ledger: Arc<Ledger>,
    /// Member list and snapshot storage
    coordination: Arc<CoordinationClient>,
    /// How chains are fetched
    transport: Arc<dyn PeerTransport>,
    /// Timing
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(
        self_address: String,
        ledger: Arc<Ledger>,
        coordination: Arc<CoordinationClient>,
        transport: Arc<dyn PeerTransport>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            self_address,
            ledger,
            coordination,
            transport,
            config,
        }
    }

    /// Startup pass: wait for a session and for peers to register, then reconcile
    pub async fn reconcile_once(&self) -> ReconcileOutcome {
        let policy = Backoff::fixed(self.config.connect_interval, self.config.connect_attempts.max(1));
        let connected = wait_until(&policy, || async { self.coordination.is_connected() }).await;
        if !connected {
            tracing::warn!(
                "No coordination session after {} checks, keeping local chain",
                self.config.connect_attempts
            );
            return ReconcileOutcome::Disconnected;
        }

        tokio::time::sleep(self.config.settle_delay).await;
        self.reconcile_now().await
    }

    /// Reconcile against whoever is registered right now
    pub async fn reconcile_now(&self) -> ReconcileOutcome {
        let members = match self.coordination.list_active_members().await {
            Ok(members) => members,
            Err(e) => {
                tracing::warn!("Reconciliation skipped, member list unavailable: {}", e);
                return ReconcileOutcome::Disconnected;
            }
        };
        let peers: Vec<String> = members.into_iter().filter(|m| *m != self.self_address).collect();

        let mut best: Option<(String, Vec<Block>)> = None;
        let mut reached = 0usize;

        for peer in &peers {
            match timeout(self.config.fetch_timeout, self.transport.fetch_chain(peer)).await {
                Ok(Ok(chain)) => {
                    reached += 1;
                    tracing::debug!("Peer {} holds {} blocks", peer, chain.len());
                    consider(&mut best, peer.clone(), chain);
                }
                Ok(Err(e)) => tracing::warn!("Could not fetch chain from {}: {}", peer, e),
                Err(_) => tracing::warn!("Fetching chain from {} timed out", peer),
            }
        }

        if self.config.include_snapshot {
            match self.coordination.load_snapshot().await {
                Ok(Some(snapshot)) => consider(&mut best, "snapshot".to_string(), snapshot.chain),
                Ok(None) => {}
                Err(e) => tracing::warn!("Could not load chain snapshot: {}", e),
            }
        }

        let Some((source, candidate)) = best else {
            return if peers.is_empty() {
                tracing::info!("No peers to reconcile with, keeping local chain");
                ReconcileOutcome::NoPeers
            } else {
                tracing::warn!("None of {} peers answered, keeping local chain", peers.len());
                ReconcileOutcome::Unreachable
            };
        };

        let length = candidate.len();
        match self.ledger.replace(candidate).await {
            Ok(()) => {
                tracing::info!("Adopted chain of {} blocks from {} ({} peers reached)", length, source, reached);
                ReconcileOutcome::Adopted { source, length }
            }
            Err(reason) => {
                tracing::debug!("Kept local chain over {} from {}: {}", length, source, reason);
                ReconcileOutcome::Kept(reason)
            }
        }
    }

    /// Startup pass followed by periodic passes until shutdown
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            outcome = self.reconcile_once() => {
                tracing::info!("Startup reconciliation: {:?}", outcome);
            }
            _ = shutdown.changed() => return,
        }

        let Some(interval) = self.config.interval else {
            return;
        };
        self.run_periodic(interval, shutdown).await;
    }

    /// Repeat `reconcile_now` every `interval` until shutdown
    pub async fn run_periodic(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let ReconcileOutcome::Adopted { source, length } = self.reconcile_now().await {
                        tracing::info!("Periodic reconciliation adopted {} blocks from {}", length, source);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

/// Keep the longest candidate; the first one seen wins ties
fn consider(best: &mut Option<(String, Vec<Block>)>, source: String, chain: Vec<Block>) {
    let longer = best.as_ref().map_or(true, |(_, current)| chain.len() > current.len());
    if longer {
        *best = Some((source, chain));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{ClientConfig, ConnectionState, CoordinationBackend, CreateMode, MemoryBackend};
    use crate::error::{Error, Result};
    use crate::replication::SyncOutcome;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;

    /// Peers serving fixed chains; missing peers are unreachable
    struct StaticChains(HashMap<String, Vec<Block>>);

    #[async_trait]
    impl PeerTransport for StaticChains {
        async fn push_block(&self, _peer: &str, _block: &Block) -> Result<SyncOutcome> {
            Ok(SyncOutcome::Accepted)
        }

        async fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>> {
            self.0.get(peer).cloned().ok_or_else(|| Error::ConnectionFailed {
                address: peer.to_string(),
                reason: "refused".into(),
            })
        }
    }

    async fn chain_of(len: usize) -> Vec<Block> {
        let ledger = Ledger::new(0);
        for i in 1..len {
            ledger.append_local(json!({ "doc": i })).await.unwrap();
        }
        ledger.blocks().await
    }

    fn config() -> ReconcileConfig {
        ReconcileConfig {
            settle_delay: Duration::ZERO,
            interval: None,
            fetch_timeout: Duration::from_millis(200),
            connect_attempts: 2,
            connect_interval: Duration::from_millis(5),
            include_snapshot: false,
        }
    }

    async fn reconciler(
        members: &[&str],
        chains: HashMap<String, Vec<Block>>,
        config: ReconcileConfig,
    ) -> (Reconciler, Arc<Ledger>, Arc<CoordinationClient>) {
        let backend = Arc::new(MemoryBackend::new());
        let session = backend.open_session(Duration::from_secs(60)).await.unwrap();
        for member in members {
            backend
                .create(session, &format!("/r/nodes/{}", member), Vec::new(), CreateMode::Ephemeral)
                .await
                .unwrap();
        }
        let client_config = ClientConfig {
            root: "/r".into(),
            ..ClientConfig::default()
        };
        let client = Arc::new(CoordinationClient::new("me:1".into(), backend, client_config));
        client.force_state(ConnectionState::Connected(session));

        let ledger = Arc::new(Ledger::new(0));
        let reconciler = Reconciler::new(
            "me:1".into(),
            Arc::clone(&ledger),
            Arc::clone(&client),
            Arc::new(StaticChains(chains)),
            config,
        );
        (reconciler, ledger, client)
    }

    #[tokio::test]
    async fn test_adopts_longest_peer_chain() {
        let mut chains = HashMap::new();
        chains.insert("a:1".to_string(), chain_of(3).await);
        chains.insert("b:2".to_string(), chain_of(5).await);
        let (reconciler, ledger, _) = reconciler(&["me:1", "a:1", "b:2"], chains, config()).await;

        let outcome = reconciler.reconcile_once().await;
        assert_eq!(outcome, ReconcileOutcome::Adopted { source: "b:2".into(), length: 5 });
        assert_eq!(ledger.len().await, 5);
    }

    #[tokio::test]
    async fn test_first_seen_wins_ties() {
        let mut chains = HashMap::new();
        chains.insert("a:1".to_string(), chain_of(4).await);
        chains.insert("b:2".to_string(), chain_of(4).await);
        let (reconciler, ledger, _) = reconciler(&["me:1", "b:2", "a:1"], chains.clone(), config()).await;

        let outcome = reconciler.reconcile_now().await;
        assert_eq!(outcome, ReconcileOutcome::Adopted { source: "a:1".into(), length: 4 });
        assert_eq!(ledger.blocks().await, chains["a:1"]);
    }

    #[tokio::test]
    async fn test_alone_keeps_local_chain() {
        let (reconciler, ledger, _) = reconciler(&["me:1"], HashMap::new(), config()).await;
        assert_eq!(reconciler.reconcile_once().await, ReconcileOutcome::NoPeers);
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn test_unreachable_peers_keep_local_chain() {
        let (reconciler, ledger, _) = reconciler(&["me:1", "a:1"], HashMap::new(), config()).await;
        assert_eq!(reconciler.reconcile_now().await, ReconcileOutcome::Unreachable);
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn test_shorter_or_equal_chain_is_kept_out() {
        let mut chains = HashMap::new();
        chains.insert("a:1".to_string(), chain_of(1).await);
        let (reconciler, _, _) = reconciler(&["me:1", "a:1"], chains, config()).await;

        assert!(matches!(
            reconciler.reconcile_now().await,
            ReconcileOutcome::Kept(ValidationError::NotLonger { .. })
        ));
    }

    #[tokio::test]
    async fn test_disconnected_gives_up() {
        let (reconciler, _, client) = reconciler(&["me:1"], HashMap::new(), config()).await;
        client.force_state(ConnectionState::Disconnected);
        assert_eq!(reconciler.reconcile_once().await, ReconcileOutcome::Disconnected);
    }

    #[tokio::test]
    async fn test_snapshot_is_a_candidate() {
        let cfg = ReconcileConfig {
            include_snapshot: true,
            ..config()
        };
        let (reconciler, ledger, client) = reconciler(&["me:1"], HashMap::new(), cfg).await;

        let source = Ledger::new(0);
        for i in 0..3 {
            source.append_local(json!(i)).await.unwrap();
        }
        client.save_snapshot(&source.snapshot().await).await.unwrap();

        assert_eq!(
            reconciler.reconcile_now().await,
            ReconcileOutcome::Adopted { source: "snapshot".into(), length: 4 }
        );
        assert_eq!(ledger.len().await, 4);
    }
}
