//! Coordination Module
//!
//! Session-scoped ephemeral entries, exclusive create, child enumeration and
//! deletion notification. Leadership uniqueness and peer membership are
//! delegated entirely to these primitives.

mod memory;
pub mod protocol;
mod remote;
mod server;
mod client;

pub use memory::{MemoryBackend, WatchEvent};
pub use remote::RemoteBackend;
pub use server::CoordinationServer;
pub use client::{ClientConfig, CoordinationClient};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Identifier of a coordination session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifetime of a created entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateMode {
    /// Removed when the owning session ends
    Ephemeral,
    /// Survives its creator
    Persistent,
}

/// Connectivity as seen by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected(SessionId),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }

    pub fn session(&self) -> Option<SessionId> {
        match self {
            ConnectionState::Connected(session) => Some(*session),
            ConnectionState::Disconnected => None,
        }
    }
}

/// Well-known paths under the cluster root
#[derive(Debug, Clone)]
pub struct Paths {
    root: String,
}

impl Paths {
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into();
        let root = root.trim_end_matches('/').to_string();
        Self { root }
    }

    /// Parent of member registrations
    pub fn nodes(&self) -> String {
        format!("{}/nodes", self.root)
    }

    /// Registration entry for one member
    pub fn node(&self, address: &str) -> String {
        format!("{}/nodes/{}", self.root, address)
    }

    /// Leadership token
    pub fn leader(&self) -> String {
        format!("{}/leader", self.root)
    }

    /// Durable chain snapshot
    pub fn blockchain(&self) -> String {
        format!("{}/blockchain", self.root)
    }
}

/// Last path component
pub(crate) fn child_name<'a>(parent: &str, path: &'a str) -> Option<&'a str> {
    let rest = path.strip_prefix(parent)?.strip_prefix('/')?;
    if rest.is_empty() || rest.contains('/') {
        None
    } else {
        Some(rest)
    }
}

/// Primitives offered by a coordination service.
///
/// Parents are implicit: creating `/a/b` does not require `/a` to exist.
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    /// Open a session that expires after `timeout` without keep-alives
    async fn open_session(&self, timeout: Duration) -> Result<SessionId>;

    /// Refresh a session; fails with `SessionExpired` once it is gone
    async fn keep_alive(&self, session: SessionId) -> Result<()>;

    /// End a session, removing its ephemeral entries
    async fn close_session(&self, session: SessionId) -> Result<()>;

    /// Exclusively create an entry; `NodeExists` if the path is taken
    async fn create(&self, session: SessionId, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<()>;

    /// Remove an entry; `NoNode` if absent
    async fn delete(&self, session: SessionId, path: &str) -> Result<()>;

    /// Read an entry
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Durably create or overwrite an entry
    async fn set(&self, session: SessionId, path: &str, data: Vec<u8>) -> Result<()>;

    /// Names of the direct children of `path`, sorted
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Resolve once `path` does not exist
    async fn wait_for_deletion(&self, path: &str) -> Result<()>;
}
