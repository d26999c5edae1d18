//! Ledger Module
//!
//! Append-only, hash-chained record of notarized documents.

pub mod block;
mod chain;
mod snapshot;

pub use block::{digest, meets_difficulty, Block, BlockIndex, GENESIS_PREVIOUS_HASH, MAX_DIFFICULTY};
pub use chain::{validate_chain, Ledger, Record};
pub use snapshot::ChainSnapshot;
