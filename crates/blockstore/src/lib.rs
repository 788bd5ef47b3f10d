// blockstore/src/lib.rs

//! Tiered Block Storage
//!
//! This crate persists finalized blocks for a sharder node:
//! - Hot tier of local disk volumes with capacity-aware placement
//! - Optional front cache with LRU replacement
//! - Optional cold tier (archival disk or S3-compatible object store)
//! - Durable block location metadata and background migration

pub mod cache;
pub mod codec;
pub mod cold;
pub mod config;
pub mod disk_tier;
pub mod fsutil;
pub mod metadata;
pub mod recovery;
pub mod selector;
pub mod store;
pub mod volume;
pub mod workers;

pub use cache::{Cache, CacheStats};
pub use cold::{ColdFilter, ColdStorageProvider, ColdTier};
pub use config::{StartupMode, StorageConfig, Strategy, Topology};
pub use disk_tier::DiskTier;
pub use metadata::{BlockWhereRecord, MetadataConfig, MetadataStore, Tiering, UnmovedBlockRecord};
pub use recovery::RecoveryReport;
pub use store::{BlockStore, MigrationReport, StoreStats};
pub use volume::Volume;
pub use workers::Workers;

use std::path::PathBuf;

/// Bytes in one GiB, the unit of disk volume capacity settings
pub const GB: u64 = 1024 * 1024 * 1024;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Volume {0} is full")]
    VolumeFull(PathBuf),

    #[error("Unable to select any available volume")]
    UnableToSelectVolume,

    #[error("Unable to select any available cold storage")]
    UnableToSelectColdStorage,

    #[error("Available size {available} of {path} is below the reserve of {reserve} bytes")]
    SizeLimit { path: String, available: u64, reserve: u64 },

    #[error("Available inodes {available} of {path} are below the reserve of {reserve}")]
    InodesLimit { path: String, available: u64, reserve: u64 },

    #[error("Allowed block size limit reached for {0}")]
    AllowedSizeLimit(String),

    #[error("Allowed block count limit reached for {0}")]
    AllowedCountLimit(String),

    #[error("At least 50% of {kind} must be able to store blocks ({accepted} of {configured} usable)")]
    FiftyPercent { kind: &'static str, accepted: usize, configured: usize },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid block hash: {0:?}")]
    InvalidHash(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Cold storage error: {0}")]
    ColdStorageError(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<object_store::Error> for StorageError {
    fn from(e: object_store::Error) -> Self {
        match e {
            object_store::Error::NotFound { path, .. } => StorageError::NotFound(path),
            other => StorageError::ColdStorageError(other.to_string()),
        }
    }
}
