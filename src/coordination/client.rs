//! Coordination Client
//!
//! A node's view of the coordination service: its registration, the member
//! list, the leadership token and the durable chain snapshot. `run` owns the
//! session and is the only writer of the published connection state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::{ConnectionState, CoordinationBackend, CreateMode, Paths, SessionId};
use crate::error::{Error, Result};
use crate::ledger::ChainSnapshot;
use crate::retry::{retry, Backoff};

/// Session settings for a coordination client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Root path shared by the cluster
    pub root: String,
    /// Session expiry without keep-alives
    pub session_timeout: Duration,
    /// Interval between keep-alives
    pub keepalive_interval: Duration,
    /// First reconnection delay
    pub reconnect_initial: Duration,
    /// Largest reconnection delay
    pub reconnect_max: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            root: "/notary".to_string(),
            session_timeout: Duration::from_millis(6000),
            keepalive_interval: Duration::from_millis(1000),
            reconnect_initial: Duration::from_millis(200),
            reconnect_max: Duration::from_millis(5000),
        }
    }
}

/// Client for one node's coordination session
pub struct CoordinationClient {
    /// Address this node registers under (host:port)
    address: String,
    /// Backend in use
    backend: Arc<dyn CoordinationBackend>,
    /// Well-known paths
    paths: Paths,
    /// Session settings
    config: ClientConfig,
    /// Published connection state
    state: watch::Sender<ConnectionState>,
}

impl CoordinationClient {
    pub fn new(address: String, backend: Arc<dyn CoordinationBackend>, config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            address,
            paths: Paths::new(config.root.clone()),
            backend,
            config,
            state,
        }
    }

    /// Address this node registers under
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether a session is currently held
    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Publish a connection state without running the session loop
    #[cfg(test)]
    pub(crate) fn force_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn session(&self) -> Result<SessionId> {
        self.connection_state().session().ok_or(Error::NotConnected)
    }

    /// Record this node as a live member.
    ///
    /// A registration left behind by an earlier session is replaced.
    pub async fn register_self(&self) -> Result<()> {
        let session = self.session()?;
        let path = self.paths.node(&self.address);
        let data = self.address.as_bytes().to_vec();

        match self.backend.create(session, &path, data.clone(), CreateMode::Ephemeral).await {
            Err(Error::NodeExists(_)) => {
                tracing::warn!("Replacing stale registration at {}", path);
                match self.backend.delete(session, &path).await {
                    Ok(()) | Err(Error::NoNode(_)) => {}
                    Err(e) => return Err(e),
                }
                self.backend.create(session, &path, data, CreateMode::Ephemeral).await
            }
            other => other,
        }
    }

    /// Addresses of all registered members, sorted
    pub async fn list_active_members(&self) -> Result<Vec<String>> {
        self.session()?;
        let mut members = self.backend.children(&self.paths.nodes()).await?;
        members.sort();
        Ok(members)
    }

    /// Try to take the leadership token; `false` if someone else holds it.
    ///
    /// A token already naming this node counts as held, which covers a
    /// create whose reply was lost.
    pub async fn try_acquire_leadership(&self) -> Result<bool> {
        let session = self.session()?;
        let data = self.address.as_bytes().to_vec();

        match self.backend.create(session, &self.paths.leader(), data, CreateMode::Ephemeral).await {
            Ok(()) => Ok(true),
            Err(Error::NodeExists(_)) => {
                let holder = self.current_leader_address().await?;
                Ok(holder.as_deref() == Some(self.address.as_str()))
            }
            Err(e) => Err(e),
        }
    }

    /// Confirm the session is live, then report who holds the token
    pub async fn confirm_leader(&self) -> Result<Option<String>> {
        let session = self.session()?;
        self.backend.keep_alive(session).await?;
        self.current_leader_address().await
    }

    /// Resolve when the leadership token is absent
    pub async fn leadership_vacated(&self) -> Result<()> {
        self.backend.wait_for_deletion(&self.paths.leader()).await
    }

    /// Address stored in the leadership token, if any
    pub async fn current_leader_address(&self) -> Result<Option<String>> {
        let data = self.backend.get(&self.paths.leader()).await?;
        Ok(data.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Store the chain snapshot at the durable path
    pub async fn save_snapshot(&self, snapshot: &ChainSnapshot) -> Result<()> {
        let session = self.session()?;
        self.backend.set(session, &self.paths.blockchain(), snapshot.to_bytes()?).await
    }

    /// Load the chain snapshot from the durable path
    pub async fn load_snapshot(&self) -> Result<Option<ChainSnapshot>> {
        self.session()?;
        match self.backend.get(&self.paths.blockchain()).await? {
            Some(bytes) => Ok(Some(ChainSnapshot::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Open a session and register, or fail without leaving one behind
    async fn establish(&self) -> Result<SessionId> {
        let session = self.backend.open_session(self.config.session_timeout).await?;
        self.state.send_replace(ConnectionState::Connected(session));

        if let Err(e) = self.register_self().await {
            self.state.send_replace(ConnectionState::Disconnected);
            let _ = self.backend.close_session(session).await;
            return Err(e);
        }

        tracing::info!("Coordination session {} established, registered as {}", session, self.address);
        Ok(session)
    }

    /// Hold a session until shutdown.
    ///
    /// Connects with unbounded backoff, keeps the session alive, and on
    /// keep-alive failure publishes `Disconnected` and starts over. Every new
    /// session re-registers this node.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let policy = Backoff::unbounded(self.config.reconnect_initial, self.config.reconnect_max);

        'session: loop {
            if *shutdown.borrow() {
                break;
            }

            let session = tokio::select! {
                result = retry(&policy, "coordination connect", || self.establish()) => match result {
                    Ok(session) => session,
                    Err(e) => {
                        tracing::error!("Coordination connect gave up: {}", e);
                        continue 'session;
                    }
                },
                _ = shutdown.changed() => break,
            };

            let mut ticker = tokio::time::interval(self.config.keepalive_interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.backend.keep_alive(session).await {
                            tracing::warn!("Coordination session {} lost: {}", session, e);
                            self.state.send_replace(ConnectionState::Disconnected);
                            continue 'session;
                        }
                    }
                    _ = shutdown.changed() => break 'session,
                }
            }
        }

        self.close().await;
    }

    /// End the current session, dropping registration and any leadership
    pub async fn close(&self) {
        if let Some(session) = self.connection_state().session() {
            self.state.send_replace(ConnectionState::Disconnected);
            if let Err(e) = self.backend.close_session(session).await {
                tracing::debug!("Closing coordination session {} failed: {}", session, e);
            }
            tracing::info!("Coordination session {} closed", session);
        }
    }
}
