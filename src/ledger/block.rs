//! Ledger Block Types
//!
//! Defines a single hash-linked record of the notary ledger and the
//! canonical digest every node computes over it.

use chrono::{DateTime, SecondsFormat, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Block height in the chain (genesis is 0)
pub type BlockIndex = u64;

/// `previous_hash` carried by the genesis block
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Largest accepted mining difficulty in leading zero hex digits
pub const MAX_DIFFICULTY: u32 = 8;

/// Payload carried by the genesis block
pub const GENESIS_PAYLOAD: &str = "Genesis Block";

/// A single immutable ledger record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Position in the chain
    pub index: BlockIndex,
    /// Creation time (microsecond precision, UTC)
    #[serde(with = "canonical_time")]
    pub timestamp: DateTime<Utc>,
    /// Opaque notarized record
    pub payload: Value,
    /// Hash of the predecessor block
    pub previous_hash: String,
    /// Hex SHA-256 over the canonical preimage
    pub hash: String,
    /// Proof-of-work counter (0 when mining is disabled)
    #[serde(default)]
    pub nonce: u64,
}

impl Block {
    /// Build a block and seal it with its digest
    pub fn new(
        index: BlockIndex,
        timestamp: DateTime<Utc>,
        payload: Value,
        previous_hash: String,
    ) -> Self {
        let timestamp = timestamp.trunc_subsecs(6);
        let hash = digest(index, &timestamp, &payload, &previous_hash, 0);
        Self {
            index,
            timestamp,
            payload,
            previous_hash,
            hash,
            nonce: 0,
        }
    }

    /// The deterministic first block shared by every node
    pub fn genesis() -> Self {
        let timestamp = Utc
            .with_ymd_and_hms(2022, 12, 31, 21, 0, 0)
            .single()
            .unwrap_or_default();
        Self::new(
            0,
            timestamp,
            Value::String(GENESIS_PAYLOAD.to_string()),
            GENESIS_PREVIOUS_HASH.to_string(),
        )
    }

    /// Recompute the digest from the block's current fields
    pub fn compute_hash(&self) -> String {
        digest(
            self.index,
            &self.timestamp,
            &self.payload,
            &self.previous_hash,
            self.nonce,
        )
    }

    /// Whether the stored hash matches the block's contents
    pub fn has_valid_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }

    /// Search for a nonce whose digest has `difficulty` leading zero hex digits.
    ///
    /// Difficulty 0 leaves the block untouched.
    pub fn mine(&mut self, difficulty: u32) {
        if difficulty == 0 {
            return;
        }

        while !meets_difficulty(&self.hash, difficulty) {
            self.nonce = self.nonce.wrapping_add(1);
            self.hash = self.compute_hash();
        }

        tracing::debug!(
            "Mined block {} with nonce {}: {}",
            self.index,
            self.nonce,
            self.hash
        );
    }

    /// Whether the payload mentions `needle` as a string value anywhere
    pub fn mentions(&self, needle: &str) -> bool {
        value_mentions(&self.payload, needle)
    }
}

/// Canonical digest over the block fields.
///
/// The preimage is compact JSON with a fixed key order
/// (`index`, `timestamp`, `payload`, `previous_hash`, `nonce`). Object keys
/// inside the payload come out sorted because `serde_json::Map` is ordered.
pub fn digest(
    index: BlockIndex,
    timestamp: &DateTime<Utc>,
    payload: &Value,
    previous_hash: &str,
    nonce: u64,
) -> String {
    let preimage = format!(
        r#"{{"index":{},"timestamp":{},"payload":{},"previous_hash":{},"nonce":{}}}"#,
        index,
        Value::String(canonical_time::format(timestamp)),
        payload,
        Value::String(previous_hash.to_string()),
        nonce,
    );

    let mut hasher = Sha256::new();
    hasher.update(preimage.as_bytes());
    hex::encode(hasher.finalize())
}

/// Whether a hex digest has at least `difficulty` leading zeros
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    hash.len() >= difficulty as usize && hash.bytes().take(difficulty as usize).all(|b| b == b'0')
}

fn value_mentions(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(s) => s == needle,
        Value::Array(items) => items.iter().any(|v| value_mentions(v, needle)),
        Value::Object(map) => map.values().any(|v| value_mentions(v, needle)),
        _ => false,
    }
}

/// Fixed RFC 3339 rendering used both on the wire and in the digest
pub mod canonical_time {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn format(timestamp: &DateTime<Utc>) -> String {
        timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    pub fn serialize<S: Serializer>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(timestamp))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let timestamp = DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)?;

        // Only one rendering may map to a given digest
        if format(&timestamp) != raw {
            return Err(serde::de::Error::custom(format!("non-canonical timestamp '{}'", raw)));
        }
        Ok(timestamp)
    }
}
