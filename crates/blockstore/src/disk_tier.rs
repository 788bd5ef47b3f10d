// blockstore/src/disk_tier.rs

use crate::codec;
use crate::config::{DiskConfig, StartupMode, Strategy, VolumeConfig};
use crate::selector::{PoolKind, Selector};
use crate::volume::{DirLayout, Volume, VolumeStats, HOT_LAYOUT};
use crate::{StorageError, StorageResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Hot tier: a pool of local volumes behind a placement selector
pub struct DiskTier {
    selector: Selector<Volume>,
    volumes: Vec<Arc<Volume>>,
}

impl DiskTier {
    /// Open every configured volume. Volumes failing their startup checks
    /// stay readable but are kept out of selection, and at least half of
    /// them must be usable.
    pub fn open(config: &DiskConfig, mode: StartupMode) -> StorageResult<Self> {
        let members = open_volumes(&config.volumes, HOT_LAYOUT, mode, PoolKind::Volume)?;
        tracing::info!(
            "✓ Disk tier initialized: {} volume(s), {} usable, strategy={:?}",
            members.len(),
            members.iter().filter(|m| m.usable).count(),
            config.strategy
        );
        Ok(Self::from_members(config.strategy, members))
    }

    pub fn from_volumes(strategy: Strategy, volumes: Vec<Arc<Volume>>) -> Self {
        Self::from_members(strategy, volumes.into_iter().map(Member::usable).collect())
    }

    pub fn from_members(strategy: Strategy, members: Vec<Member<Volume>>) -> Self {
        let volumes = members.iter().map(|m| m.target.clone()).collect();
        let (active, unable) = split_members(members);
        Self {
            selector: Selector::with_unable(PoolKind::Volume, strategy, active, unable),
            volumes,
        }
    }

    /// Write a serialized block, returning its block path
    pub async fn write(&self, hash: &str, data: &[u8]) -> StorageResult<PathBuf> {
        let compressed = codec::compress(data)?;
        self.store_compressed(hash, &compressed).await
    }

    /// Place bytes already in block file format, retrying on the next
    /// selected volume until one accepts them or the pool is exhausted.
    pub async fn store_compressed(&self, hash: &str, bytes: &[u8]) -> StorageResult<PathBuf> {
        loop {
            let volume = self.selector.acquire().await?;
            match volume.store_compressed(hash, bytes) {
                Ok(path) => {
                    tracing::debug!("Stored block {} at {}", hash, path.display());
                    return Ok(path);
                }
                Err(e) => {
                    tracing::warn!("Writing block {} to {} failed: {}", hash, volume.path().display(), e);
                    self.selector.evict(&volume);
                }
            }
        }
    }

    /// Read and decompress a block file
    pub fn read(&self, block_path: &Path) -> StorageResult<Vec<u8>> {
        match self.volume_for(block_path) {
            Some(volume) => volume.read(block_path),
            None => codec::decompress(&std::fs::read(block_path)?),
        }
    }

    /// Delete a block file through its owning volume
    pub fn delete(&self, block_path: &Path) -> StorageResult<()> {
        let volume = self.volume_for(block_path).ok_or_else(|| {
            StorageError::NotFound(format!("no volume owns {}", block_path.display()))
        })?;
        volume.delete(block_path)
    }

    pub fn volume_for(&self, block_path: &Path) -> Option<&Arc<Volume>> {
        self.volumes.iter().find(|v| v.owns(block_path))
    }

    pub fn volumes(&self) -> &[Arc<Volume>] {
        &self.volumes
    }

    /// Return recovered volumes to the active pool
    pub fn revive(&self) -> usize {
        self.selector.revive()
    }

    pub fn unable_volumes(&self) -> Vec<String> {
        self.selector.unable_ids()
    }

    pub fn stats(&self) -> Vec<VolumeStats> {
        self.volumes.iter().map(|v| v.stats()).collect()
    }
}

/// An opened pool member and whether it passed its startup checks
pub struct Member<T: ?Sized> {
    pub target: Arc<T>,
    pub usable: bool,
}

impl<T: ?Sized> Member<T> {
    pub fn usable(target: Arc<T>) -> Self {
        Self { target, usable: true }
    }
}

/// Selection pools in configured order: usable members, then the rest
pub(crate) fn split_members<T: ?Sized>(members: Vec<Member<T>>) -> (Vec<Arc<T>>, Vec<Arc<T>>) {
    let (usable, unable): (Vec<_>, Vec<_>) = members.into_iter().partition(|m| m.usable);
    (
        usable.into_iter().map(|m| m.target).collect(),
        unable.into_iter().map(|m| m.target).collect(),
    )
}

/// Open volumes with the given layout and enforce the fifty percent rule.
///
/// A volume that loads but fails its headroom checks is still returned, so
/// its blocks stay readable and recoverable.
pub(crate) fn open_volumes(
    configs: &[VolumeConfig],
    layout: DirLayout,
    mode: StartupMode,
    kind: PoolKind,
) -> StorageResult<Vec<Member<Volume>>> {
    let mut members = Vec::with_capacity(configs.len());
    for cfg in configs {
        let volume = match Volume::load(&cfg.path, cfg.limits(), layout, mode) {
            Ok(volume) => volume,
            Err(e) => {
                tracing::error!("Volume {} rejected: {}", cfg.path, e);
                continue;
            }
        };
        let usable = match volume.check_startup_capacity(mode) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Volume {} unable to store blocks: {}", cfg.path, e);
                false
            }
        };
        members.push(Member {
            target: Arc::new(volume),
            usable,
        });
    }
    let usable = members.iter().filter(|m| m.usable).count();
    check_fifty_percent(kind, usable, configs.len())?;
    Ok(members)
}

pub(crate) fn check_fifty_percent(kind: PoolKind, accepted: usize, configured: usize) -> StorageResult<()> {
    if configured == 0 {
        return Err(StorageError::ConfigError(format!("no {} configured", kind.name())));
    }
    if accepted == 0 || accepted * 2 < configured {
        return Err(StorageError::FiftyPercent {
            kind: kind.name(),
            accepted,
            configured,
        });
    }
    Ok(())
}
