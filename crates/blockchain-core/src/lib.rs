// blockchain-core/src/lib.rs

//! Core blockchain data structures
//!
//! This crate provides:
//! - Block structure and content hashing
//! - Block byte encoding shared by every storage tier

pub mod block;
pub mod types;

pub use block::Block;
pub use types::*;

/// Result type for blockchain operations
pub type BlockchainResult<T> = Result<T, BlockchainError>;

/// Errors that can occur in blockchain operations
#[derive(Debug, thiserror::Error)]
pub enum BlockchainError {
    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch { expected: String, computed: String },

    #[error("Serialization error: {0}")]
    SerializationError(String),
}
