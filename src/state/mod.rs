//! State Management Module
//!
//! Tracks this node's role in the cluster.

pub mod election;

pub use election::{transition, ElectionEvent, ElectionState, LeaderElection};
