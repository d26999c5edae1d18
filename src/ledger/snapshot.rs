//! Chain Snapshot
//!
//! Serializable `{chain, difficulty}` record handed off through the
//! coordination service's durable storage.

use serde::{Deserialize, Serialize};

use super::block::Block;
use crate::error::Result;

/// Full chain plus the mining difficulty it was built with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub chain: Vec<Block>,
    pub difficulty: u32,
}

impl ChainSnapshot {
    /// Encode as JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
