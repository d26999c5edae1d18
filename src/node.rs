//! Notary Node
//!
//! Composes the ledger, coordination session, election, replication and
//! reconciliation of one node. The HTTP layer calls into it.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::NotaryConfig;
use crate::coordination::{CoordinationBackend, CoordinationClient, RemoteBackend};
use crate::error::{Error, Result};
use crate::ledger::{Block, Ledger, Record};
use crate::network::HttpPeerClient;
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::replication::{BlockIntake, PeerTransport, ReplicationReport, Replicator, StatsSnapshot, SyncOutcome};
use crate::state::{ElectionState, LeaderElection};

/// Point-in-time view of a node
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub address: String,
    pub is_leader: bool,
    pub role: String,
    pub leader: Option<String>,
    pub chain_length: usize,
    pub coordination_connected: bool,
    pub replication: StatsSnapshot,
}

/// One member of the notary cluster
pub struct NotaryNode {
    address: String,
    persist_snapshot: bool,
    ledger: Arc<Ledger>,
    coordination: Arc<CoordinationClient>,
    election: Arc<LeaderElection>,
    replicator: Arc<Replicator>,
    intake: BlockIntake,
    reconciler: Arc<Reconciler>,
    /// Serializes snapshot saves so a stale chain never lands last
    snapshot_lock: Mutex<()>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NotaryNode {
    /// Build a node over the given coordination backend and peer transport
    pub fn new(
        config: &NotaryConfig,
        backend: Arc<dyn CoordinationBackend>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        let address = config.address().to_string();
        let ledger = Arc::new(Ledger::new(config.ledger.difficulty));
        let coordination = Arc::new(CoordinationClient::new(address.clone(), backend, config.client_config()));
        let election = Arc::new(LeaderElection::new(
            Arc::clone(&coordination),
            config.client_config().reconnect_initial,
            config.takeover_delay(),
        ));
        let replicator = Arc::new(Replicator::new(
            address.clone(),
            Arc::clone(&coordination),
            Arc::clone(&transport),
            config.replication_config(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            address.clone(),
            Arc::clone(&ledger),
            Arc::clone(&coordination),
            transport,
            config.reconcile_config(),
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            address,
            persist_snapshot: config.ledger.persist_snapshot,
            intake: BlockIntake::new(Arc::clone(&ledger)),
            ledger,
            coordination,
            election,
            replicator,
            reconciler,
            snapshot_lock: Mutex::new(()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build a node that reaches the coordination server and peers over the network
    pub fn from_config(config: &NotaryConfig) -> Result<Self> {
        let backend = Arc::new(RemoteBackend::new(
            config.coordination.address.clone(),
            config.request_timeout(),
            config.poll_interval(),
        ));
        let transport = Arc::new(HttpPeerClient::new(Duration::from_millis(
            config.replication.push_timeout_ms.max(config.reconciliation.fetch_timeout_ms),
        ))?);
        Ok(Self::new(config, backend, transport))
    }

    /// Address this node is known by
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Shared ledger
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Coordination client
    pub fn coordination(&self) -> &Arc<CoordinationClient> {
        &self.coordination
    }

    /// Current role
    pub fn role(&self) -> ElectionState {
        self.election.current()
    }

    /// Watch role changes
    pub fn subscribe_role(&self) -> watch::Receiver<ElectionState> {
        self.election.subscribe()
    }

    /// Spawn the session loop, the election driver and reconciliation
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }

        let coordination = Arc::clone(&self.coordination);
        let shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move { coordination.run(shutdown).await }));

        let election = Arc::clone(&self.election);
        let shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move { election.run(shutdown).await }));

        let reconciler = Arc::clone(&self.reconciler);
        let shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move { reconciler.run(shutdown).await }));

        tracing::info!("Notary node {} started", self.address);
    }

    /// Mint a block for `payload` and replicate it in the background.
    ///
    /// Only the leader mints; others answer `LeaderRequired`.
    pub async fn mint(&self, payload: Value) -> Result<(Block, JoinHandle<ReplicationReport>)> {
        if *self.shutdown.borrow() {
            return Err(Error::ShuttingDown);
        }
        match self.election.current() {
            ElectionState::Leader => {}
            ElectionState::Follower { leader } => return Err(Error::LeaderRequired { leader }),
            ElectionState::Connecting => return Err(Error::LeaderRequired { leader: None }),
        }

        // The published role may trail a session that already died
        match self.coordination.confirm_leader().await {
            Ok(Some(holder)) if holder == self.address => {}
            Ok(leader) => {
                tracing::warn!("Refusing to mint: token held by {:?}", leader);
                return Err(Error::LeaderRequired { leader });
            }
            Err(e) if e.is_session_loss() => {
                tracing::warn!("Refusing to mint: {}", e);
                return Err(Error::LeaderRequired { leader: None });
            }
            Err(e) => return Err(e),
        }

        let block = self.ledger.append_local(payload).await?;

        if self.persist_snapshot {
            let _guard = self.snapshot_lock.lock().await;
            let snapshot = self.ledger.snapshot().await;
            if let Err(e) = self.coordination.save_snapshot(&snapshot).await {
                tracing::warn!("Could not store chain snapshot: {}", e);
            }
        }

        let replication = self.replicator.dispatch(block.clone());
        Ok((block, replication))
    }

    /// Accept a block pushed by the leader
    pub async fn sync_block(&self, block: Block) -> SyncOutcome {
        self.intake.receive(block).await
    }

    /// Accept a raw push body
    pub async fn sync_value(&self, body: Value) -> SyncOutcome {
        self.intake.receive_value(body).await
    }

    /// Full chain in order
    pub async fn export_chain(&self) -> Vec<Block> {
        self.ledger.blocks().await
    }

    /// Every notarized document in chain order
    pub async fn records(&self) -> Vec<Record> {
        self.ledger.records().await
    }

    /// First block whose payload mentions `needle`
    pub async fn find_record(&self, needle: &str) -> Option<Block> {
        self.ledger.find_record(needle).await
    }

    /// Reconcile against current peers now
    pub async fn reconcile(&self) -> ReconcileOutcome {
        self.reconciler.reconcile_now().await
    }

    /// Snapshot of this node's state
    pub async fn status(&self) -> NodeStatus {
        let role = self.election.current();
        let leader = match &role {
            ElectionState::Leader => Some(self.address.clone()),
            ElectionState::Follower { leader } => leader.clone(),
            ElectionState::Connecting => None,
        };

        NodeStatus {
            address: self.address.clone(),
            is_leader: role.is_leader(),
            role: role.to_string(),
            leader,
            chain_length: self.ledger.len().await,
            coordination_connected: self.coordination.is_connected(),
            replication: self.replicator.stats(),
        }
    }

    /// Stop background tasks and end the coordination session
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                tracing::warn!("Background task did not stop in time");
            }
        }

        self.coordination.close().await;
        tracing::info!("Notary node {} stopped", self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryBackend;
    use serde_json::json;

    struct NoPeers;

    #[async_trait::async_trait]
    impl PeerTransport for NoPeers {
        async fn push_block(&self, peer: &str, _block: &Block) -> Result<SyncOutcome> {
            Err(Error::Network(format!("no route to {}", peer)))
        }

        async fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>> {
            Err(Error::Network(format!("no route to {}", peer)))
        }
    }

    fn test_config(address: &str) -> NotaryConfig {
        let mut config = NotaryConfig::for_address(address);
        config.coordination.keepalive_interval_ms = 20;
        config.coordination.reconnect_initial_ms = 10;
        config.coordination.takeover_delay_ms = 20;
        config.replication.settle_delay_ms = 0;
        config.reconciliation.settle_delay_ms = 0;
        config.reconciliation.interval_secs = 0;
        config
    }

    async fn wait_leader(node: &NotaryNode) {
        let mut rx = node.subscribe_role();
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let leader = rx.borrow_and_update().is_leader();
                if leader {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_follower_cannot_mint() {
        let node = NotaryNode::new(&test_config("a:1"), Arc::new(MemoryBackend::new()), Arc::new(NoPeers));
        let err = node.mint(json!("doc")).await.unwrap_err();
        assert!(matches!(err, Error::LeaderRequired { leader: None }));
        assert_eq!(node.export_chain().await.len(), 1);
    }

    #[tokio::test]
    async fn test_lone_node_leads_and_mints() {
        let backend = Arc::new(MemoryBackend::new());
        let node = NotaryNode::new(&test_config("a:1"), backend, Arc::new(NoPeers));
        node.start().await;
        wait_leader(&node).await;

        let (block, replication) = node.mint(json!({"hash": "d1"})).await.unwrap();
        assert_eq!(block.index, 1);
        let report = replication.await.unwrap();
        assert_eq!(report.total_followers, 0);

        assert_eq!(node.find_record("d1").await, Some(block));
        let status = node.status().await;
        assert!(status.is_leader);
        assert_eq!(status.role, "LEADER");
        assert_eq!(status.leader.as_deref(), Some("a:1"));
        assert_eq!(status.chain_length, 2);

        node.shutdown().await;
        assert!(!node.coordination().is_connected());
        assert!(matches!(node.mint(json!("late")).await, Err(Error::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_mint_persists_snapshot_when_enabled() {
        let backend = Arc::new(MemoryBackend::new());
        let mut config = test_config("a:1");
        config.ledger.persist_snapshot = true;
        let node = NotaryNode::new(&config, backend.clone(), Arc::new(NoPeers));
        node.start().await;
        wait_leader(&node).await;

        node.mint(json!("doc")).await.unwrap();
        let stored = node.coordination().load_snapshot().await.unwrap().unwrap();
        assert_eq!(stored.chain, node.export_chain().await);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_leader_refuses_to_mint() {
        let backend = Arc::new(MemoryBackend::new());
        let node = NotaryNode::new(&test_config("a:1"), backend.clone(), Arc::new(NoPeers));
        node.start().await;
        wait_leader(&node).await;

        let session = node.coordination().connection_state().session().unwrap();
        backend.expire_session(session).await;

        let err = node.mint(json!("forked")).await.unwrap_err();
        assert!(matches!(err, Error::LeaderRequired { .. }));
        assert_eq!(node.export_chain().await.len(), 1);

        node.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_mints_store_latest_snapshot() {
        let backend = Arc::new(MemoryBackend::new());
        let mut config = test_config("a:1");
        config.ledger.persist_snapshot = true;
        let node = Arc::new(NotaryNode::new(&config, backend, Arc::new(NoPeers)));
        node.start().await;
        wait_leader(&node).await;

        let mints: Vec<_> = (0..10)
            .map(|i| {
                let node = Arc::clone(&node);
                tokio::spawn(async move { node.mint(json!({ "doc": i })).await.map(|(block, _)| block) })
            })
            .collect();
        for mint in mints {
            mint.await.unwrap().unwrap();
        }

        let stored = node.coordination().load_snapshot().await.unwrap().unwrap();
        assert_eq!(stored.chain.len(), 11);
        assert_eq!(stored.chain, node.export_chain().await);
        assert_eq!(node.records().await.len(), 10);

        node.shutdown().await;
    }
}
