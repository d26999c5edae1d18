//! Leader Election
//!
//! Leadership is an exclusively created ephemeral token in the coordination
//! service. The role a node acts on is derived by one pure transition
//! function and published by a single driver task.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::coordination::{ConnectionState, CoordinationClient, SessionId};

/// Role of this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ElectionState {
    /// No coordination session
    Connecting,
    /// Another node holds the token (if known)
    Follower { leader: Option<String> },
    /// This node holds the token
    Leader,
}

impl ElectionState {
    pub fn is_leader(&self) -> bool {
        matches!(self, ElectionState::Leader)
    }
}

impl std::fmt::Display for ElectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionState::Connecting => write!(f, "CONNECTING"),
            ElectionState::Follower { .. } => write!(f, "FOLLOWER"),
            ElectionState::Leader => write!(f, "LEADER"),
        }
    }
}

/// Input to the election state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionEvent {
    /// A coordination session is held
    SessionEstablished,
    /// The token was created by this node
    Acquired,
    /// Someone else holds the token
    AcquisitionFailed { leader: Option<String> },
    /// The token disappeared
    LeadershipVacated,
    /// The coordination session ended
    SessionLost,
}

/// Next state for `event` in `state`
pub fn transition(state: &ElectionState, event: ElectionEvent) -> ElectionState {
    use ElectionEvent::*;
    use ElectionState::*;

    match (state, event) {
        (_, SessionLost) => Connecting,
        (Connecting, SessionEstablished) => Follower { leader: None },
        (current, SessionEstablished) => current.clone(),
        (Connecting, LeadershipVacated) => Connecting,
        (_, LeadershipVacated) => Follower { leader: None },
        (_, Acquired) => Leader,
        (_, AcquisitionFailed { leader }) => Follower { leader },
    }
}

/// Drives the state machine against the coordination service
pub struct LeaderElection {
    /// Coordination client
    client: Arc<CoordinationClient>,
    /// Published role
    state: watch::Sender<ElectionState>,
    /// Pause before retrying after a failed coordination call
    retry_delay: Duration,
    /// Pause between seeing a vacancy and contending for it
    takeover_delay: Duration,
}

impl LeaderElection {
    pub fn new(client: Arc<CoordinationClient>, retry_delay: Duration, takeover_delay: Duration) -> Self {
        let (state, _) = watch::channel(ElectionState::Connecting);
        Self {
            client,
            state,
            retry_delay,
            takeover_delay,
        }
    }

    /// Current role
    pub fn current(&self) -> ElectionState {
        self.state.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.state.borrow().is_leader()
    }

    /// Watch role changes
    pub fn subscribe(&self) -> watch::Receiver<ElectionState> {
        self.state.subscribe()
    }

    /// Apply an event and publish the result
    fn apply(&self, event: ElectionEvent) -> ElectionState {
        let previous = self.current();
        let next = transition(&previous, event.clone());

        if next != previous {
            match &next {
                ElectionState::Leader => tracing::info!("Acquired leadership, becoming LEADER"),
                ElectionState::Follower { leader } => tracing::info!(
                    "Following leader {} ({:?})",
                    leader.as_deref().unwrap_or("unknown"),
                    event
                ),
                ElectionState::Connecting => tracing::warn!("Lost coordination session, role revoked"),
            }
        }

        self.state.send_replace(next.clone());
        next
    }

    /// Run until shutdown
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut connection = self.client.subscribe();

        loop {
            let session = tokio::select! {
                session = wait_for_session(&mut connection) => match session {
                    Some(session) => session,
                    None => return,
                },
                _ = shutdown.changed() => return,
            };
            self.apply(ElectionEvent::SessionEstablished);

            if !self.contend(session, &mut connection, &mut shutdown).await {
                return;
            }
        }
    }

    /// Contend for the token while `session` lives.
    ///
    /// Returns `false` on shutdown, `true` once the session is gone.
    async fn contend(
        &self,
        session: SessionId,
        connection: &mut watch::Receiver<ConnectionState>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            if self.client.connection_state().session() != Some(session) {
                self.apply(ElectionEvent::SessionLost);
                return true;
            }

            match self.client.try_acquire_leadership().await {
                Ok(true) => {
                    self.apply(ElectionEvent::Acquired);
                }
                Ok(false) => {
                    let leader = match self.client.current_leader_address().await {
                        Ok(leader) => leader,
                        Err(e) => {
                            tracing::debug!("Could not read leader address: {}", e);
                            None
                        }
                    };
                    self.apply(ElectionEvent::AcquisitionFailed { leader });
                }
                Err(e) if e.is_session_loss() => {
                    self.apply(ElectionEvent::SessionLost);
                    return true;
                }
                Err(e) => {
                    tracing::warn!("Leadership attempt failed: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_delay) => continue,
                        _ = shutdown.changed() => return false,
                    }
                }
            }

            let event = match self.watch_token(session, connection, shutdown).await {
                Some(event) => event,
                None => return false,
            };

            let lost = event == ElectionEvent::SessionLost;
            self.apply(event);
            if lost {
                return true;
            }

            // A holder whose session died sees the same vacancy; let it step
            // down before anyone contends
            tokio::select! {
                _ = tokio::time::sleep(self.takeover_delay) => {}
                _ = shutdown.changed() => return false,
            }
        }
    }

    /// Wait until the token is vacated or `session` ends.
    ///
    /// A failed watch is re-armed without touching the current role.
    /// Returns `None` on shutdown.
    async fn watch_token(
        &self,
        session: SessionId,
        connection: &mut watch::Receiver<ConnectionState>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<ElectionEvent> {
        loop {
            tokio::select! {
                vacated = self.client.leadership_vacated() => match vacated {
                    Ok(()) => return Some(ElectionEvent::LeadershipVacated),
                    Err(e) if e.is_session_loss() => return Some(ElectionEvent::SessionLost),
                    Err(e) => tracing::warn!("Leadership watch failed, re-arming: {}", e),
                },
                _ = wait_for_session_change(connection, session) => return Some(ElectionEvent::SessionLost),
                _ = shutdown.changed() => return None,
            }

            tokio::select! {
                _ = tokio::time::sleep(self.retry_delay) => {}
                _ = wait_for_session_change(connection, session) => return Some(ElectionEvent::SessionLost),
                _ = shutdown.changed() => return None,
            }
        }
    }
}

/// Wait for a connected state; `None` if the publisher is gone
async fn wait_for_session(connection: &mut watch::Receiver<ConnectionState>) -> Option<SessionId> {
    loop {
        let current = *connection.borrow_and_update();
        if let Some(session) = current.session() {
            return Some(session);
        }
        if connection.changed().await.is_err() {
            return None;
        }
    }
}

/// Wait until `session` is no longer the one held
async fn wait_for_session_change(connection: &mut watch::Receiver<ConnectionState>, session: SessionId) {
    loop {
        let current = *connection.borrow_and_update();
        if current.session() != Some(session) {
            return;
        }
        if connection.changed().await.is_err() {
            return;
        }
    }
}
