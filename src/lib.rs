//! Notary - Distributed Digital Notary
//!
//! A small cluster of peer nodes maintaining a replicated, append-only,
//! hash-chained ledger of notarized records.
//!
//! # Architecture
//!
//! Exactly one node at a time mints new blocks. Leadership is an ephemeral
//! token held in a coordination service, so it disappears with its holder's
//! session and another node takes over. The leader pushes every new block to
//! all registered followers; followers validate and append. Nodes that
//! restart or were partitioned adopt the longest valid chain among their
//! peers, at startup and periodically after that.
//!
//! # Features
//!
//! - SHA-256 hash chain with optional proof-of-work mining
//! - Leader election through exclusive ephemeral entries
//! - Concurrent best-effort block replication
//! - Longest-valid-chain reconciliation
//! - Standalone coordination service and in-process backend for tests
//! - HTTP API for minting, replication and status

pub mod config;
pub mod error;
pub mod retry;
pub mod ledger;
pub mod coordination;
pub mod state;
pub mod replication;
pub mod reconcile;
pub mod network;
pub mod node;
pub mod api;

pub use config::NotaryConfig;
pub use error::{Error, Result};
pub use node::NotaryNode;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::NotaryConfig;
    pub use crate::error::{Error, Result, ValidationError};
    pub use crate::ledger::{Block, Ledger};
    pub use crate::coordination::{CoordinationBackend, CoordinationClient, MemoryBackend};
    pub use crate::state::ElectionState;
    pub use crate::replication::{PeerTransport, SyncOutcome};
    pub use crate::node::NotaryNode;
}
