// blockstore/src/cold/mod.rs

//! Cold tier: archival providers behind the same placement selector as the
//! hot tier.

pub mod disk;
pub mod minio;

use crate::codec;
use crate::config::{ColdConfig, ColdStorageType, StartupMode, Strategy};
use crate::disk_tier::{check_fifty_percent, open_volumes, split_members, Member};
use crate::selector::{Placement, PoolKind, Selector};
use crate::volume::COLD_LAYOUT;
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

pub use disk::ColdDisk;
pub use minio::MinioProvider;

/// A block held by a cold provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColdEntry {
    pub hash: String,
    pub cold_path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Selection of cold blocks by hash prefix and modification window
#[derive(Debug, Clone, Default)]
pub struct ColdFilter {
    pub prefix: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl ColdFilter {
    pub fn matches(&self, entry: &ColdEntry) -> bool {
        self.prefix.as_deref().map_or(true, |p| entry.hash.starts_with(p))
            && self.start.map_or(true, |s| entry.modified >= s)
            && self.end.map_or(true, |e| entry.modified <= e)
    }
}

/// Cold storage unit with a capacity-aware write contract.
///
/// Every provider stores the block file bytes (zlib compressed) unchanged,
/// so a block can move between tiers without being re-encoded.
#[async_trait]
pub trait ColdStorageProvider: Placement {
    /// Compress and store a serialized block, returning its cold path
    async fn write_block(&self, hash: &str, data: &[u8]) -> StorageResult<String>;

    /// Copy a hot block file, returning its cold path
    async fn move_block(&self, hash: &str, hot_path: &Path) -> StorageResult<String>;

    /// Stored (compressed) bytes of a block
    async fn get_block(&self, hash: &str, cold_path: &str) -> StorageResult<Vec<u8>>;

    async fn exists(&self, hash: &str, cold_path: &str) -> StorageResult<bool>;

    /// Every block currently held
    async fn scan(&self) -> StorageResult<Vec<ColdEntry>>;

    /// Whether a recorded cold path points at this provider
    fn owns(&self, cold_path: &str) -> bool;

    async fn get_blocks(&self, filter: &ColdFilter) -> StorageResult<Vec<Vec<u8>>> {
        let mut blocks = Vec::new();
        for entry in self.scan().await? {
            if filter.matches(&entry) {
                blocks.push(self.get_block(&entry.hash, &entry.cold_path).await?);
            }
        }
        Ok(blocks)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStats {
    pub id: String,
    pub blocks_count: u64,
    pub blocks_size: u64,
}

pub struct ColdTier {
    selector: Selector<dyn ColdStorageProvider>,
    providers: Vec<Arc<dyn ColdStorageProvider>>,
    delete_local: bool,
}

impl ColdTier {
    /// Open every configured provider. Providers at their ceilings stay
    /// readable but are kept out of selection.
    pub async fn open(config: &ColdConfig, mode: StartupMode) -> StorageResult<Self> {
        mode.ensure_supported()?;

        let members: Vec<Member<dyn ColdStorageProvider>> = match config.storage_type {
            ColdStorageType::Disk => open_volumes(&config.volumes, COLD_LAYOUT, mode, PoolKind::ColdStorage)?
                .into_iter()
                .map(|m| Member {
                    target: Arc::new(ColdDisk::new(m.target)) as Arc<dyn ColdStorageProvider>,
                    usable: m.usable,
                })
                .collect(),
            ColdStorageType::Minio => {
                let mut members: Vec<Member<dyn ColdStorageProvider>> = Vec::new();
                for cfg in &config.minio {
                    let provider = match MinioProvider::open(cfg, config.timeout(), mode).await {
                        Ok(provider) => provider,
                        Err(e) => {
                            tracing::error!(
                                "Cold storage {}:{} rejected: {}",
                                cfg.storage_service_url,
                                cfg.bucket_name,
                                e
                            );
                            continue;
                        }
                    };
                    let usable = match provider.check_capacity() {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::error!("Cold storage {} unable to store blocks: {}", provider.id(), e);
                            false
                        }
                    };
                    members.push(Member {
                        target: Arc::new(provider) as Arc<dyn ColdStorageProvider>,
                        usable,
                    });
                }
                let usable = members.iter().filter(|m| m.usable).count();
                check_fifty_percent(PoolKind::ColdStorage, usable, config.minio.len())?;
                members
            }
        };

        tracing::info!(
            "✓ Cold tier initialized: {} {:?} provider(s), {} usable, strategy={:?}, delete_local={}",
            members.len(),
            config.storage_type,
            members.iter().filter(|m| m.usable).count(),
            config.strategy,
            config.delete_local
        );
        Ok(Self::from_members(config.strategy, members, config.delete_local))
    }

    pub fn from_providers(
        strategy: Strategy,
        providers: Vec<Arc<dyn ColdStorageProvider>>,
        delete_local: bool,
    ) -> Self {
        Self::from_members(strategy, providers.into_iter().map(Member::usable).collect(), delete_local)
    }

    pub fn from_members(
        strategy: Strategy,
        members: Vec<Member<dyn ColdStorageProvider>>,
        delete_local: bool,
    ) -> Self {
        let providers = members.iter().map(|m| m.target.clone()).collect();
        let (active, unable) = split_members(members);
        Self {
            selector: Selector::with_unable(PoolKind::ColdStorage, strategy, active, unable),
            providers,
            delete_local,
        }
    }

    /// Store a serialized block directly in cold storage
    pub async fn write_block(&self, hash: &str, data: &[u8]) -> StorageResult<String> {
        loop {
            let provider = self.selector.acquire().await?;
            match provider.write_block(hash, data).await {
                Ok(cold_path) => return Ok(cold_path),
                Err(e) => {
                    tracing::warn!("Cold write of {} to {} failed: {}", hash, provider.id(), e);
                    self.selector.evict(&provider);
                }
            }
        }
    }

    /// Copy a hot block file to the next selected provider. Failing
    /// providers are taken out of rotation and the next one is tried.
    pub async fn move_block(&self, hash: &str, hot_path: &Path) -> StorageResult<String> {
        loop {
            let provider = self.selector.acquire().await?;
            match provider.move_block(hash, hot_path).await {
                Ok(cold_path) => {
                    tracing::debug!("Moved block {} to {}", hash, cold_path);
                    return Ok(cold_path);
                }
                Err(StorageError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    // the source is gone, no provider can do better
                    return Err(StorageError::IoError(e));
                }
                Err(e) => {
                    tracing::warn!("Moving block {} to {} failed: {}", hash, provider.id(), e);
                    self.selector.evict(&provider);
                }
            }
        }
    }

    /// Read and decompress a block from the provider owning `cold_path`
    pub async fn read(&self, hash: &str, cold_path: &str) -> StorageResult<Vec<u8>> {
        let provider = self.provider_for(cold_path)?;
        let raw = provider.get_block(hash, cold_path).await?;
        codec::decompress(&raw)
    }

    pub async fn exists(&self, hash: &str, cold_path: &str) -> StorageResult<bool> {
        match self.provider_for(cold_path) {
            Ok(provider) => provider.exists(hash, cold_path).await,
            Err(_) => Ok(false),
        }
    }

    fn provider_for(&self, cold_path: &str) -> StorageResult<&Arc<dyn ColdStorageProvider>> {
        self.providers
            .iter()
            .find(|p| p.owns(cold_path))
            .ok_or_else(|| StorageError::NotFound(format!("no cold storage owns {}", cold_path)))
    }

    pub fn providers(&self) -> &[Arc<dyn ColdStorageProvider>] {
        &self.providers
    }

    pub fn delete_local(&self) -> bool {
        self.delete_local
    }

    pub fn revive(&self) -> usize {
        self.selector.revive()
    }

    pub fn unable_providers(&self) -> Vec<String> {
        self.selector.unable_ids()
    }

    pub fn stats(&self) -> Vec<ProviderStats> {
        self.providers
            .iter()
            .map(|p| ProviderStats {
                id: p.id().to_string(),
                blocks_count: p.blocks_count(),
                blocks_size: p.blocks_size(),
            })
            .collect()
    }
}
