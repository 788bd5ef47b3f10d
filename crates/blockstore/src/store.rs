// blockstore/src/store.rs

use crate::cache::{Cache, CacheStats};
use crate::codec;
use crate::cold::{ColdTier, ProviderStats};
use crate::config::{StartupMode, StorageConfig, Topology, WritePolicy};
use crate::disk_tier::DiskTier;
use crate::metadata::{BlockWhereRecord, MetadataConfig, MetadataStore, Tiering, UnmovedBlockRecord};
use crate::recovery::{self, RecoveryReport};
use crate::volume::VolumeStats;
use crate::workers::Workers;
use crate::{StorageError, StorageResult};
use blockchain_core::{Block, Round};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Failed migrations of one block before its unmoved record is dropped
pub const MIGRATION_ATTEMPTS: u32 = 3;

/// Outcome of one migration batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub moved: usize,
    pub failed: usize,
    /// Blocks given up on after [`MIGRATION_ATTEMPTS`] failures
    pub abandoned: usize,
}

/// Engine statistics
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub mode: StartupMode,
    pub topology: Topology,
    pub blocks: u64,
    pub unmoved_blocks: u64,
    pub volumes: Vec<VolumeStats>,
    pub unable_volumes: Vec<String>,
    pub cold_storages: Vec<ProviderStats>,
    pub unable_cold_storages: Vec<String>,
    pub cache: Option<CacheStats>,
    pub recovery: Option<RecoveryReport>,
}

/// Tiered block store: the single entry point for writing, reading and
/// migrating blocks under the configured topology.
pub struct BlockStore {
    config: StorageConfig,
    metadata: Arc<MetadataStore>,
    disk: DiskTier,
    cache: Option<Arc<Cache>>,
    cold: Option<ColdTier>,
    recovery: Option<RecoveryReport>,
    migration_failures: Mutex<HashMap<String, u32>>,
}

impl BlockStore {
    /// Open every configured tier according to the startup mode.
    ///
    /// Must be called inside a Tokio runtime.
    pub async fn open(config: StorageConfig) -> StorageResult<Self> {
        config.validate()?;
        config.mode.ensure_supported()?;
        let mode = config.mode;

        tracing::info!(
            "Opening block store: mode={}, topology={:?}",
            mode.as_str(),
            config.topology
        );

        let metadata = Arc::new(MetadataStore::open(MetadataConfig {
            path: config.metadata_path.clone(),
            wipe: mode != StartupMode::Restart,
            ..Default::default()
        })?);

        let cold = match (&config.cold, config.topology.has_cold()) {
            (Some(cold_config), true) => Some(ColdTier::open(cold_config, mode).await?),
            _ => None,
        };

        let disk = DiskTier::open(config.disk()?, mode)?;

        let cache = match (&config.cache, config.topology.has_cache()) {
            (Some(cache_config), true) => Some(Arc::new(Cache::open(cache_config, metadata.clone())?)),
            _ => None,
        };

        let recovery = if mode == StartupMode::Recover {
            Some(recovery::rebuild(&metadata, &disk, cold.as_ref()).await?)
        } else {
            None
        };

        tracing::info!(
            "✓ Block store initialized: {} block(s) known, {} waiting for cold storage",
            metadata.bwr_count()?,
            metadata.unmoved_count()?
        );

        Ok(Self {
            config,
            metadata,
            disk,
            cache,
            cold,
            recovery,
            migration_failures: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    pub fn disk(&self) -> &DiskTier {
        &self.disk
    }

    pub fn cache(&self) -> Option<&Arc<Cache>> {
        self.cache.as_ref()
    }

    pub fn cold(&self) -> Option<&ColdTier> {
        self.cold.as_ref()
    }

    fn cold_tier(&self, operation: &str) -> StorageResult<&ColdTier> {
        self.cold.as_ref().ok_or_else(|| {
            StorageError::NotImplemented(format!(
                "{} requires cold storage, topology is {:?}",
                operation, self.config.topology
            ))
        })
    }

    fn bwr(&self, hash: &str) -> StorageResult<BlockWhereRecord> {
        self.metadata
            .get_bwr(hash)?
            .ok_or_else(|| StorageError::NotFound(format!("block {}", hash)))
    }

    // ==================== WRITE ====================

    /// Persist a block. Returns once its location record is stored.
    ///
    /// Writing a hash that is already stored changes nothing and returns
    /// the existing record.
    pub async fn write(&self, block: &Block) -> StorageResult<BlockWhereRecord> {
        let hash = block.hash.as_str();
        codec::check_hash(hash)?;
        if let Some(existing) = self.metadata.get_bwr(hash)? {
            tracing::debug!("Block {} already stored ({:?}), write skipped", hash, existing.tiering);
            return Ok(existing);
        }
        let data = codec::encode_block(block)?;

        if let Some(cache) = self.cache_with(WritePolicy::WriteThrough) {
            if let Err(e) = cache.write(hash, &data, Utc::now()).await {
                tracing::warn!("Failed to cache block {}: {}", hash, e);
            }
        }

        let block_path = self.disk.write(hash, &data).await?;
        let record = BlockWhereRecord::on_disk(hash, &block_path);
        self.metadata.put_bwr(&record)?;

        if self.cold.is_some() {
            self.metadata.add_unmoved(&UnmovedBlockRecord::new(hash, Utc::now()))?;
        }

        if let Some(cache) = self.cache_with(WritePolicy::WriteBack) {
            spawn_cache_write(cache.clone(), hash.to_string(), data);
        }

        tracing::debug!("Block {} (round {}) written to {}", hash, block.round, block_path.display());
        Ok(record)
    }

    fn cache_with(&self, policy: WritePolicy) -> Option<&Arc<Cache>> {
        self.cache.as_ref().filter(|c| c.write_policy() == policy)
    }

    // ==================== READ ====================

    /// Read a block: cache first, then the tiers named by its location record
    pub async fn read(&self, hash: &str, round: Round) -> StorageResult<Block> {
        codec::check_hash(hash)?;
        let record = self
            .metadata
            .get_bwr(hash)?
            .ok_or_else(|| StorageError::NotFound(format!("block {} of round {}", hash, round)))?;

        if let Some(cache) = &self.cache {
            match cache.read(hash).await {
                Ok(Some(data)) => match codec::decode_block_for(hash, &data) {
                    Ok(block) => return Ok(block),
                    Err(e) => tracing::debug!("Ignoring cached copy of {}: {}", hash, e),
                },
                Ok(None) => {}
                Err(e) => tracing::debug!("Cache read of {} failed: {}", hash, e),
            }
        }

        let (block, data) = self.read_from_tiers(&record).await?;
        self.repopulate_cache(hash, data).await;
        Ok(block)
    }

    async fn read_from_tiers(&self, record: &BlockWhereRecord) -> StorageResult<(Block, Vec<u8>)> {
        let hash = record.hash.as_str();

        if record.tiering.has_disk() && !record.block_path.is_empty() {
            let hot = self
                .disk
                .read(Path::new(&record.block_path))
                .and_then(|data| codec::decode_block_for(hash, &data).map(|block| (block, data)));
            match hot {
                Ok(found) => return Ok(found),
                Err(e) if record.tiering.has_cold() => {
                    tracing::warn!("Hot copy of {} unreadable ({}), falling back to cold storage", hash, e);
                }
                Err(e) => return Err(e),
            }
        }

        if record.tiering.has_cold() {
            let cold = self.cold_tier("reading a cold block")?;
            let data = cold.read(hash, &record.cold_path).await?;
            let block = codec::decode_block_for(hash, &data)?;
            return Ok((block, data));
        }

        Err(StorageError::NotFound(format!("block {} has no readable copy", hash)))
    }

    async fn repopulate_cache(&self, hash: &str, data: Vec<u8>) {
        let Some(cache) = &self.cache else {
            return;
        };
        match cache.write_policy() {
            WritePolicy::WriteThrough => {
                if let Err(e) = cache.write(hash, &data, Utc::now()).await {
                    tracing::warn!("Failed to cache block {}: {}", hash, e);
                }
            }
            WritePolicy::WriteBack => spawn_cache_write(cache.clone(), hash.to_string(), data),
        }
    }

    // ==================== DELETE ====================

    /// Administrative delete. Blocks archived in cold storage are append
    /// only, so any topology with a cold tier refuses.
    pub async fn delete(&self, hash: &str) -> StorageResult<()> {
        codec::check_hash(hash)?;
        if self.cold.is_some() {
            return Err(StorageError::NotImplemented(format!(
                "delete with cold storage configured ({:?})",
                self.config.topology
            )));
        }

        let record = self.bwr(hash)?;
        if !record.block_path.is_empty() {
            match self.disk.delete(Path::new(&record.block_path)) {
                Ok(()) => {}
                Err(StorageError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!("Block file {} already gone", record.block_path);
                }
                Err(e) => return Err(e),
            }
        }
        if let Some(cache) = &self.cache {
            cache.remove(hash).await?;
        }
        self.metadata.delete_bwr(hash)?;
        tracing::info!("Block {} deleted", hash);
        Ok(())
    }

    // ==================== TIERING ====================

    /// Copy a hot block to cold storage and return its cold path. A block
    /// already in cold storage is left alone.
    pub async fn move_to_cold(&self, hash: &str) -> StorageResult<String> {
        let cold = self.cold_tier("moving blocks to cold storage")?;
        let record = self.bwr(hash)?;
        if record.tiering.has_cold() {
            return Ok(record.cold_path);
        }

        let hot_path = PathBuf::from(&record.block_path);
        let cold_path = cold.move_block(hash, &hot_path).await?;

        if cold.delete_local() {
            self.metadata.put_bwr(&BlockWhereRecord::in_cold(hash, &cold_path))?;
            if let Err(e) = self.disk.delete(&hot_path) {
                tracing::error!("Block {} moved to {} but deleting {} failed: {}", hash, cold_path, hot_path.display(), e);
            }
        } else {
            self.metadata.put_bwr(&BlockWhereRecord {
                tiering: Tiering::DiskAndCold,
                cold_path: cold_path.clone(),
                ..record
            })?;
        }

        Ok(cold_path)
    }

    /// Migrate up to `limit` blocks written at or before `cutoff`, oldest
    /// first. Failures are isolated per block and retried next batch, up to
    /// [`MIGRATION_ATTEMPTS`] times.
    pub async fn migrate_batch(&self, cutoff: DateTime<Utc>, limit: usize) -> StorageResult<MigrationReport> {
        self.cold_tier("migration")?;
        let mut report = MigrationReport::default();

        for record in self.metadata.unmoved_before(cutoff, limit)? {
            match self.move_to_cold(&record.hash).await {
                Ok(cold_path) => {
                    self.metadata.delete_unmoved(&record)?;
                    self.migration_failures.lock().remove(&record.hash);
                    tracing::debug!("Block {} migrated to {}", record.hash, cold_path);
                    report.moved += 1;
                }
                Err(StorageError::NotFound(_)) => {
                    tracing::warn!("Dropping migration of unknown block {}", record.hash);
                    self.metadata.delete_unmoved(&record)?;
                    self.migration_failures.lock().remove(&record.hash);
                }
                Err(e @ StorageError::UnableToSelectColdStorage) => {
                    tracing::error!("Migration stopped: {}", e);
                    report.failed += 1;
                    break;
                }
                Err(e) => {
                    if self.migration_failed(&record.hash) {
                        tracing::error!(
                            "Giving up on migrating block {} after {} attempts: {}",
                            record.hash,
                            MIGRATION_ATTEMPTS,
                            e
                        );
                        self.metadata.delete_unmoved(&record)?;
                        report.abandoned += 1;
                    } else {
                        tracing::warn!("Failed to migrate block {}: {}", record.hash, e);
                        report.failed += 1;
                    }
                }
            }
        }

        if report != MigrationReport::default() {
            tracing::info!(
                "Migration batch: {} moved, {} failed, {} abandoned",
                report.moved,
                report.failed,
                report.abandoned
            );
        }
        Ok(report)
    }

    /// Count a failed attempt; true once the block has used up its attempts
    fn migration_failed(&self, hash: &str) -> bool {
        let mut failures = self.migration_failures.lock();
        let attempts = failures.entry(hash.to_string()).or_insert(0);
        *attempts += 1;
        if *attempts < MIGRATION_ATTEMPTS {
            return false;
        }
        failures.remove(hash);
        true
    }

    // ==================== CLOUD PASS-THROUGHS ====================

    pub async fn upload_to_cloud(&self, hash: &str, round: Round) -> StorageResult<String> {
        let cold_path = self.move_to_cold(hash).await?;
        tracing::info!("Block {} of round {} uploaded to {}", hash, round, cold_path);
        Ok(cold_path)
    }

    /// Restore a hot copy of an archived block
    pub async fn download_from_cloud(&self, hash: &str, round: Round) -> StorageResult<PathBuf> {
        let cold = self.cold_tier("downloading from cold storage")?;
        let record = self.bwr(hash)?;
        if record.tiering.has_disk() {
            return Ok(PathBuf::from(record.block_path));
        }

        let data = cold.read(hash, &record.cold_path).await?;
        codec::decode_block_for(hash, &data)?;
        let block_path = self.disk.write(hash, &data).await?;
        self.metadata.put_bwr(&BlockWhereRecord {
            tiering: Tiering::DiskAndCold,
            block_path: block_path.display().to_string(),
            ..record
        })?;

        tracing::info!("Block {} of round {} restored to {}", hash, round, block_path.display());
        Ok(block_path)
    }

    pub async fn cloud_object_exists(&self, hash: &str) -> StorageResult<bool> {
        let cold = self.cold_tier("querying cold storage")?;
        match self.metadata.get_bwr(hash)? {
            Some(record) if record.tiering.has_cold() => cold.exists(hash, &record.cold_path).await,
            _ => Ok(false),
        }
    }

    // ==================== MAINTENANCE ====================

    /// Re-admit evicted volumes and cold storages
    pub fn revive(&self) -> usize {
        let mut revived = self.disk.revive();
        if let Some(cold) = &self.cold {
            revived += cold.revive();
        }
        revived
    }

    /// Start the background workers for the configured tiers
    pub fn start_workers(self: &Arc<Self>) -> Workers {
        Workers::spawn(self.clone())
    }

    pub fn stats(&self) -> StorageResult<StoreStats> {
        Ok(StoreStats {
            mode: self.config.mode,
            topology: self.config.topology,
            blocks: self.metadata.bwr_count()?,
            unmoved_blocks: self.metadata.unmoved_count()?,
            volumes: self.disk.stats(),
            unable_volumes: self.disk.unable_volumes(),
            cold_storages: self.cold.as_ref().map(|c| c.stats()).unwrap_or_default(),
            unable_cold_storages: self.cold.as_ref().map(|c| c.unable_providers()).unwrap_or_default(),
            cache: self.cache.as_ref().map(|c| c.stats()),
            recovery: self.recovery,
        })
    }
}

fn spawn_cache_write(cache: Arc<Cache>, hash: String, data: Vec<u8>) {
    tokio::spawn(async move {
        if let Err(e) = cache.write(&hash, &data, Utc::now()).await {
            tracing::warn!("Background cache write of {} failed: {}", hash, e);
        }
    });
}
