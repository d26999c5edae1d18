//! Chain Ledger
//!
//! Owns the node's hash-linked chain. Every mutation (local mint,
//! replicated append, bulk replace) runs under one write lock so the
//! chain invariants hold between operations.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use super::block::{canonical_time, Block, BlockIndex};
use super::snapshot::ChainSnapshot;
use crate::error::{Error, ValidationError};

/// One notarized document and the block that holds it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub index: BlockIndex,
    #[serde(with = "canonical_time")]
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

/// Chain contents plus a hash index for duplicate detection
struct ChainState {
    blocks: Vec<Block>,
    hashes: HashSet<String>,
}

impl ChainState {
    fn from_blocks(blocks: Vec<Block>) -> Self {
        let hashes = blocks.iter().map(|b| b.hash.clone()).collect();
        Self { blocks, hashes }
    }

    fn tail(&self) -> &Block {
        // The chain always holds at least the genesis block
        &self.blocks[self.blocks.len() - 1]
    }

    fn push(&mut self, block: Block) {
        self.hashes.insert(block.hash.clone());
        self.blocks.push(block);
    }
}

/// The single-writer ledger shared by a node's components
pub struct Ledger {
    state: RwLock<ChainState>,
    /// Leading zero hex digits required on locally minted blocks
    difficulty: u32,
}

impl Ledger {
    /// Create a ledger holding only the genesis block
    pub fn new(difficulty: u32) -> Self {
        Self {
            state: RwLock::new(ChainState::from_blocks(vec![Block::genesis()])),
            difficulty,
        }
    }

    /// Mining difficulty applied by `append_local`
    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    /// Build, mine and append the next block atop the current tail.
    ///
    /// Mining runs on the blocking pool without the lock held. If another
    /// block landed meanwhile the candidate is rebuilt on the new tail.
    /// Only the node runtime calls this, and only while it holds leadership.
    pub async fn append_local(&self, payload: Value) -> crate::Result<Block> {
        loop {
            let tail = self.tail().await;
            let candidate = Block::new(tail.index + 1, Utc::now(), payload.clone(), tail.hash);
            let block = self.seal(candidate).await?;

            let mut state = self.state.write().await;
            if state.tail().hash == block.previous_hash {
                state.push(block.clone());
                tracing::info!("Minted block {} ({})", block.index, block.hash);
                return Ok(block);
            }
            tracing::debug!("Tail moved while sealing block {}, rebuilding", block.index);
        }
    }

    async fn seal(&self, mut block: Block) -> crate::Result<Block> {
        let difficulty = self.difficulty;
        if difficulty == 0 {
            return Ok(block);
        }

        tokio::task::spawn_blocking(move || {
            block.mine(difficulty);
            block
        })
        .await
        .map_err(|e| Error::Internal(format!("mining task failed: {}", e)))
    }

    /// Validate and append a block minted elsewhere.
    ///
    /// On any rejection the chain is left exactly as it was.
    pub async fn append_replicated(&self, block: Block) -> Result<(), ValidationError> {
        let mut state = self.state.write().await;

        if state.hashes.contains(&block.hash) {
            return Err(ValidationError::Duplicate { hash: block.hash });
        }
        verify_successor(state.tail(), &block)?;

        tracing::debug!("Appending replicated block {} ({})", block.index, block.hash);
        state.push(block);
        Ok(())
    }

    /// Adopt `candidate` if it is strictly longer and fully valid
    pub async fn replace(&self, candidate: Vec<Block>) -> Result<(), ValidationError> {
        let mut state = self.state.write().await;
        let local = state.blocks.len();

        if candidate.len() <= local {
            tracing::info!(
                "Candidate chain is not longer than ours ({} <= {})",
                candidate.len(),
                local
            );
            return Err(ValidationError::NotLonger {
                local,
                candidate: candidate.len(),
            });
        }

        if !validate_chain(&candidate) {
            tracing::warn!("Candidate chain of {} blocks is invalid", candidate.len());
            return Err(ValidationError::Invalid);
        }

        tracing::info!(
            "Replacing local chain ({} blocks) with candidate ({} blocks)",
            local,
            candidate.len()
        );
        *state = ChainState::from_blocks(candidate);
        Ok(())
    }

    /// Copy of the full chain in order
    pub async fn blocks(&self) -> Vec<Block> {
        self.state.read().await.blocks.clone()
    }

    /// Number of blocks, genesis included
    pub async fn len(&self) -> usize {
        self.state.read().await.blocks.len()
    }

    /// The most recent block
    pub async fn tail(&self) -> Block {
        self.state.read().await.tail().clone()
    }

    /// First block whose payload mentions `needle`
    pub async fn find_record(&self, needle: &str) -> Option<Block> {
        let state = self.state.read().await;
        state.blocks.iter().find(|b| b.mentions(needle)).cloned()
    }

    /// Every notarized document in chain order, genesis excluded
    pub async fn records(&self) -> Vec<Record> {
        let state = self.state.read().await;
        state
            .blocks
            .iter()
            .skip(1)
            .map(|b| Record {
                index: b.index,
                timestamp: b.timestamp,
                payload: b.payload.clone(),
            })
            .collect()
    }

    /// Chain plus difficulty, for hand-off through durable storage
    pub async fn snapshot(&self) -> ChainSnapshot {
        ChainSnapshot {
            chain: self.blocks().await,
            difficulty: self.difficulty,
        }
    }
}

/// Check that `block` may directly follow `prev`
fn verify_successor(prev: &Block, block: &Block) -> Result<(), ValidationError> {
    if block.index != prev.index + 1 {
        return Err(ValidationError::IndexMismatch {
            expected: prev.index + 1,
            received: block.index,
        });
    }

    if block.previous_hash != prev.hash {
        return Err(ValidationError::PrevHashMismatch {
            expected: prev.hash.clone(),
            received: block.previous_hash.clone(),
        });
    }

    if !block.has_valid_hash() {
        return Err(ValidationError::HashInvalid { index: block.index });
    }

    Ok(())
}

/// Whether `chain` is a well-formed, fully linked sequence from genesis
pub fn validate_chain(chain: &[Block]) -> bool {
    let Some(genesis) = chain.first() else {
        return false;
    };
    if *genesis != Block::genesis() {
        return false;
    }

    let mut seen = HashSet::with_capacity(chain.len());
    seen.insert(genesis.hash.as_str());

    chain.windows(2).all(|pair| {
        verify_successor(&pair[0], &pair[1]).is_ok() && seen.insert(pair[1].hash.as_str())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn ledger_with(payloads: &[&str]) -> Ledger {
        let ledger = Ledger::new(0);
        for p in payloads {
            ledger.append_local(json!(p)).await.unwrap();
        }
        ledger
    }

    #[tokio::test]
    async fn test_new_ledger_holds_genesis() {
        let ledger = Ledger::new(0);
        assert_eq!(ledger.len().await, 1);
        assert_eq!(ledger.tail().await, Block::genesis());
    }

    #[tokio::test]
    async fn test_append_local_links_to_tail() {
        let ledger = Ledger::new(0);
        let block = ledger.append_local(json!("P1")).await.unwrap();
        assert_eq!(block.index, 1);
        assert_eq!(block.previous_hash, Block::genesis().hash);
        assert!(validate_chain(&ledger.blocks().await));
    }

    #[tokio::test]
    async fn test_append_local_mines_with_difficulty() {
        let ledger = Ledger::new(1);
        let block = ledger.append_local(json!({"doc": "x"})).await.unwrap();
        assert!(block.hash.starts_with('0'));
        assert!(validate_chain(&ledger.blocks().await));
    }

    #[tokio::test]
    async fn test_append_replicated_accepts_then_flags_duplicate() {
        let leader = ledger_with(&["P1"]).await;
        let block = leader.tail().await;

        let follower = Ledger::new(0);
        follower.append_replicated(block.clone()).await.unwrap();
        assert_eq!(follower.len().await, 2);

        let err = follower.append_replicated(block.clone()).await.unwrap_err();
        assert_eq!(err, ValidationError::Duplicate { hash: block.hash });
        assert_eq!(follower.len().await, 2);
    }

    #[tokio::test]
    async fn test_append_replicated_rejections_leave_chain_untouched() {
        let leader = ledger_with(&["P1", "P2"]).await;
        let blocks = leader.blocks().await;
        let follower = Ledger::new(0);

        // Skipping block 1
        let err = follower.append_replicated(blocks[2].clone()).await.unwrap_err();
        assert!(matches!(err, ValidationError::IndexMismatch { expected: 1, received: 2 }));

        let mut wrong_prev = blocks[1].clone();
        wrong_prev.previous_hash = "f00d".into();
        let err = follower.append_replicated(wrong_prev).await.unwrap_err();
        assert!(matches!(err, ValidationError::PrevHashMismatch { .. }));

        let mut tampered = blocks[1].clone();
        tampered.hash = "0".repeat(64);
        let err = follower.append_replicated(tampered).await.unwrap_err();
        assert_eq!(err, ValidationError::HashInvalid { index: 1 });

        let mut rewritten = blocks[1].clone();
        rewritten.payload = json!("forged");
        let err = follower.append_replicated(rewritten).await.unwrap_err();
        assert_eq!(err, ValidationError::HashInvalid { index: 1 });

        assert_eq!(follower.blocks().await, vec![Block::genesis()]);
    }

    #[tokio::test]
    async fn test_validate_chain_detects_single_field_mutation() {
        let ledger = ledger_with(&["P1", "P2", "P3"]).await;
        let chain = ledger.blocks().await;
        assert!(validate_chain(&chain));

        for i in 1..chain.len() {
            let mut c = chain.clone();
            c[i].hash = "ab".repeat(32);
            assert!(!validate_chain(&c), "hash mutation at {}", i);

            let mut c = chain.clone();
            c[i].previous_hash = "cd".repeat(32);
            assert!(!validate_chain(&c), "previous_hash mutation at {}", i);

            let mut c = chain.clone();
            c[i].index += 7;
            assert!(!validate_chain(&c), "index mutation at {}", i);

            let mut c = chain.clone();
            c[i].payload = json!("tampered");
            assert!(!validate_chain(&c), "payload mutation at {}", i);
        }
    }

    #[test]
    fn test_validate_chain_rejects_empty_and_bad_genesis() {
        assert!(!validate_chain(&[]));

        let mut genesis = Block::genesis();
        genesis.previous_hash = "1".into();
        assert!(!validate_chain(&[genesis]));
    }

    #[tokio::test]
    async fn test_replace_requires_longer_valid_chain() {
        let longer = ledger_with(&["P1", "P2", "P3"]).await.blocks().await;
        let local = ledger_with(&["Q1"]).await;

        // Equal length never replaces
        let same_len = ledger_with(&["R1"]).await.blocks().await;
        let err = local.replace(same_len).await.unwrap_err();
        assert_eq!(err, ValidationError::NotLonger { local: 2, candidate: 2 });

        let mut broken = longer.clone();
        broken[2].payload = json!("tampered");
        assert_eq!(local.replace(broken).await.unwrap_err(), ValidationError::Invalid);
        assert_eq!(local.len().await, 2);

        local.replace(longer.clone()).await.unwrap();
        assert_eq!(local.blocks().await, longer);

        // The duplicate index is rebuilt from the adopted chain
        let err = local.append_replicated(longer[3].clone()).await.unwrap_err();
        assert!(matches!(err, ValidationError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn test_find_record() {
        let ledger = Ledger::new(0);
        ledger
            .append_local(json!({"hash": "abc123", "owner": "node-1"}))
            .await
            .unwrap();
        let found = ledger.find_record("abc123").await.unwrap();
        assert_eq!(found.index, 1);
        assert!(ledger.find_record("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_records_skip_genesis() {
        let ledger = ledger_with(&["P1", "P2"]).await;
        let records = ledger.records().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].index, 1);
        assert_eq!(records[0].payload, json!("P1"));
        assert_eq!(records[1].payload, json!("P2"));
        assert!(Ledger::new(0).records().await.is_empty());
    }

    #[test]
    fn test_validate_chain_rejects_foreign_genesis() {
        let foreign = Block::new(0, Utc::now(), json!("Genesis Block"), "0".into());
        assert!(foreign.has_valid_hash());
        assert!(!validate_chain(&[foreign.clone()]));

        let next = Block::new(1, Utc::now(), json!("P1"), foreign.hash.clone());
        assert!(!validate_chain(&[foreign, next]));
    }

    #[tokio::test]
    async fn test_mining_leaves_chain_readable() {
        let ledger = std::sync::Arc::new(Ledger::new(4));
        let minting = {
            let ledger = std::sync::Arc::clone(&ledger);
            tokio::spawn(async move { ledger.append_local(json!("slow")).await })
        };

        // Readers are served while the nonce search runs
        for _ in 0..5 {
            let len = tokio::time::timeout(std::time::Duration::from_millis(200), ledger.len())
                .await
                .unwrap();
            assert!(len == 1 || len == 2);
            tokio::task::yield_now().await;
        }

        let block = minting.await.unwrap().unwrap();
        assert!(block.hash.starts_with("0000"));
        assert!(validate_chain(&ledger.blocks().await));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_mints_stay_linked() {
        let ledger = std::sync::Arc::new(Ledger::new(1));
        let mints: Vec<_> = (0..8)
            .map(|i| {
                let ledger = std::sync::Arc::clone(&ledger);
                tokio::spawn(async move { ledger.append_local(json!(i)).await })
            })
            .collect();
        for mint in mints {
            mint.await.unwrap().unwrap();
        }

        let chain = ledger.blocks().await;
        assert_eq!(chain.len(), 9);
        assert!(validate_chain(&chain));
    }
}
