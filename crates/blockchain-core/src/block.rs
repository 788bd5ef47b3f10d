// blockchain-core/src/block.rs
use crate::{types::*, BlockchainError, BlockchainResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A finalized block as handed to the sharder for storage.
///
/// The storage engine treats the block as opaque apart from `hash` and
/// `round`; everything else is carried through byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Hex encoded SHA-256 over the remaining fields
    pub hash: String,
    /// Round the block was finalized in
    pub round: Round,
    /// Hash of previous block
    pub prev_hash: String,
    /// Generator of the block
    pub miner_id: String,
    /// Creation time
    pub creation_date: Timestamp,
    /// Serialized transactions and state changes
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
}

impl Block {
    /// Create a new block stamped with the current time
    pub fn new(round: Round, prev_hash: impl Into<String>, miner_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::with_creation_date(round, prev_hash, miner_id, chrono::Utc::now().timestamp(), payload)
    }

    /// Create a new block with an explicit creation time
    pub fn with_creation_date(
        round: Round,
        prev_hash: impl Into<String>,
        miner_id: impl Into<String>,
        creation_date: Timestamp,
        payload: Vec<u8>,
    ) -> Self {
        let mut block = Self {
            hash: String::new(),
            round,
            prev_hash: prev_hash.into(),
            miner_id: miner_id.into(),
            creation_date,
            payload,
        };
        block.hash = block.compute_hash();
        block
    }

    /// Calculate the content hash
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.round.to_be_bytes());
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(self.miner_id.as_bytes());
        hasher.update(self.creation_date.to_be_bytes());
        hasher.update(&self.payload);
        hex::encode(hasher.finalize())
    }

    /// Check the stored hash against the content
    pub fn validate(&self) -> BlockchainResult<()> {
        if self.hash.len() != HASH_HEX_LEN {
            return Err(BlockchainError::InvalidBlock(format!(
                "hash must be {} hex characters, got {}",
                HASH_HEX_LEN,
                self.hash.len()
            )));
        }
        let computed = self.compute_hash();
        if computed != self.hash {
            return Err(BlockchainError::HashMismatch {
                expected: self.hash.clone(),
                computed,
            });
        }
        Ok(())
    }

    /// Encode the block for storage
    pub fn to_bytes(&self) -> BlockchainResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| BlockchainError::SerializationError(e.to_string()))
    }

    /// Decode a block previously produced by [`Block::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> BlockchainResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| BlockchainError::SerializationError(e.to_string()))
    }

    /// Create genesis block
    pub fn genesis() -> Self {
        Self::with_creation_date(0, "0".repeat(HASH_HEX_LEN), "genesis", 0, b"Genesis Block".to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_genesis_block() {
        let genesis = Block::genesis();
        assert_eq!(genesis.round, 0);
        assert_eq!(genesis.hash.len(), HASH_HEX_LEN);
        assert!(genesis.validate().is_ok());
    }

    #[test]
    fn test_block_hash_is_deterministic() {
        let a = Block::with_creation_date(7, "ab", "miner", 1_700_000_000, vec![1, 2, 3]);
        let b = Block::with_creation_date(7, "ab", "miner", 1_700_000_000, vec![1, 2, 3]);
        assert_eq!(a.hash, b.hash);

        let c = Block::with_creation_date(8, "ab", "miner", 1_700_000_000, vec![1, 2, 3]);
        assert_ne!(a.hash, c.hash);
    }

    #[test]
    fn test_tampered_payload_fails_validation() {
        let mut block = Block::new(3, "prev", "miner", vec![9; 16]);
        block.payload[0] = 0;
        assert!(matches!(block.validate(), Err(BlockchainError::HashMismatch { .. })));
    }

    #[test]
    fn test_payload_is_hex_encoded() {
        let block = Block::with_creation_date(1, "p", "m", 0, vec![0xde, 0xad]);
        let json = String::from_utf8(block.to_bytes().unwrap()).unwrap();
        assert!(json.contains("\"payload\":\"dead\""));
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(Block::from_bytes(b"not a block").is_err());
    }

    proptest! {
        #[test]
        fn prop_bytes_preserve_block(round in any::<i64>(), payload in proptest::collection::vec(any::<u8>(), 0..256)) {
            let block = Block::with_creation_date(round, "prev", "miner", 42, payload);
            let decoded = Block::from_bytes(&block.to_bytes().unwrap()).unwrap();
            prop_assert_eq!(decoded, block);
        }
    }
}
