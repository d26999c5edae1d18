//! In-Process Coordination Backend
//!
//! Hosts the namespace and session table used by `CoordinationServer`, and
//! by tests that run several nodes in one process.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;

use super::{child_name, CoordinationBackend, CreateMode, SessionId};
use crate::error::{Error, Result};

/// Change notification for an entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created(String),
    Deleted(String),
}

struct Entry {
    data: Vec<u8>,
    owner: Option<SessionId>,
}

struct Session {
    timeout: Duration,
    last_seen: Instant,
}

impl Session {
    fn is_expired(&self) -> bool {
        self.last_seen.elapsed() > self.timeout
    }
}

#[derive(Default)]
struct Namespace {
    entries: BTreeMap<String, Entry>,
    sessions: HashMap<SessionId, Session>,
}

impl Namespace {
    /// Drop a session and its ephemeral entries, returning removed paths
    fn remove_session(&mut self, session: SessionId) -> Vec<String> {
        self.sessions.remove(&session);
        let owned: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            self.entries.remove(path);
        }
        owned
    }

    /// Fail with `SessionExpired` unless the session is live
    fn check_session(&mut self, session: SessionId) -> std::result::Result<(), Vec<String>> {
        match self.sessions.get(&session) {
            Some(s) if !s.is_expired() => Ok(()),
            Some(_) => Err(self.remove_session(session)),
            None => Err(Vec::new()),
        }
    }
}

/// Coordination namespace held in memory
pub struct MemoryBackend {
    state: RwLock<Namespace>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: RwLock::new(Namespace::default()),
            events,
        }
    }

    /// Subscribe to entry changes
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    /// End a session as if its holder crashed
    pub async fn expire_session(&self, session: SessionId) {
        let removed = self.state.write().await.remove_session(session);
        tracing::info!("Expired coordination session {} ({} ephemeral entries)", session, removed.len());
        self.notify_deleted(removed);
    }

    /// Expire every session that missed its keep-alive window
    pub async fn reap_expired(&self) -> Vec<SessionId> {
        let mut removed_paths = Vec::new();
        let expired: Vec<SessionId> = {
            let mut state = self.state.write().await;
            let expired: Vec<SessionId> = state
                .sessions
                .iter()
                .filter(|(_, s)| s.is_expired())
                .map(|(id, _)| *id)
                .collect();
            for session in &expired {
                removed_paths.extend(state.remove_session(*session));
            }
            expired
        };

        for session in &expired {
            tracing::info!("Coordination session {} timed out", session);
        }
        self.notify_deleted(removed_paths);
        expired
    }

    /// Periodically reap expired sessions until shutdown
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let backend = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        backend.reap_expired().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    fn notify_deleted(&self, paths: Vec<String>) {
        for path in paths {
            let _ = self.events.send(WatchEvent::Deleted(path));
        }
    }

    /// Check a session under the write lock, notifying about anything it took down
    fn live_session(&self, state: &mut Namespace, session: SessionId) -> Result<()> {
        match state.check_session(session) {
            Ok(()) => Ok(()),
            Err(removed) => {
                self.notify_deleted(removed);
                Err(Error::SessionExpired)
            }
        }
    }
}

#[async_trait]
impl CoordinationBackend for MemoryBackend {
    async fn open_session(&self, timeout: Duration) -> Result<SessionId> {
        let session = SessionId::new();
        self.state.write().await.sessions.insert(
            session,
            Session {
                timeout,
                last_seen: Instant::now(),
            },
        );
        tracing::debug!("Opened coordination session {}", session);
        Ok(session)
    }

    async fn keep_alive(&self, session: SessionId) -> Result<()> {
        let mut state = self.state.write().await;
        self.live_session(&mut state, session)?;
        if let Some(s) = state.sessions.get_mut(&session) {
            s.last_seen = Instant::now();
        }
        Ok(())
    }

    async fn close_session(&self, session: SessionId) -> Result<()> {
        let removed = self.state.write().await.remove_session(session);
        tracing::debug!("Closed coordination session {}", session);
        self.notify_deleted(removed);
        Ok(())
    }

    async fn create(&self, session: SessionId, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<()> {
        let mut state = self.state.write().await;
        self.live_session(&mut state, session)?;

        if state.entries.contains_key(path) {
            return Err(Error::NodeExists(path.to_string()));
        }

        let owner = match mode {
            CreateMode::Ephemeral => Some(session),
            CreateMode::Persistent => None,
        };
        state.entries.insert(path.to_string(), Entry { data, owner });
        drop(state);

        let _ = self.events.send(WatchEvent::Created(path.to_string()));
        Ok(())
    }

    async fn delete(&self, session: SessionId, path: &str) -> Result<()> {
        let mut state = self.state.write().await;
        self.live_session(&mut state, session)?;

        if state.entries.remove(path).is_none() {
            return Err(Error::NoNode(path.to_string()));
        }
        drop(state);

        self.notify_deleted(vec![path.to_string()]);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.state.read().await.entries.get(path).map(|e| e.data.clone()))
    }

    async fn set(&self, session: SessionId, path: &str, data: Vec<u8>) -> Result<()> {
        let mut state = self.state.write().await;
        self.live_session(&mut state, session)?;

        let created = match state.entries.get_mut(path) {
            Some(entry) => {
                entry.data = data;
                false
            }
            None => {
                state.entries.insert(path.to_string(), Entry { data, owner: None });
                true
            }
        };
        drop(state);

        if created {
            let _ = self.events.send(WatchEvent::Created(path.to_string()));
        }
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let prefix = format!("{}/", path);
        Ok(state
            .entries
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter_map(|(p, _)| child_name(path, p).map(str::to_string))
            .collect())
    }

    async fn wait_for_deletion(&self, path: &str) -> Result<()> {
        // Subscribe before looking so a deletion in between is not missed
        let mut events = self.subscribe();
        if self.get(path).await?.is_none() {
            return Ok(());
        }

        loop {
            match events.recv().await {
                Ok(WatchEvent::Deleted(p)) if p == path => return Ok(()),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if self.get(path).await?.is_none() {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::Coordination("watch channel closed".into()));
                }
            }
        }
    }
}
