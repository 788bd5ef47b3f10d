// blockstore/src/recovery.rs

//! Rebuild block location metadata from the block files themselves.
//!
//! Used in recover mode, where the metadata database is assumed lost.
//! Unreadable or corrupt files are logged and skipped; they never abort the
//! pass.

use crate::codec;
use crate::cold::ColdTier;
use crate::disk_tier::DiskTier;
use crate::fsutil;
use crate::metadata::{BlockWhereRecord, MetadataStore, Tiering, UnmovedBlockRecord};
use crate::selector::Placement;
use crate::StorageResult;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Location records created
    pub recovered: u64,
    /// Hot copies attached to a block already found in cold storage
    pub merged: u64,
    /// Files that failed validation
    pub skipped: u64,
}

/// Scan cold providers, then hot volumes, writing one location record per
/// valid block found.
pub async fn rebuild(
    metadata: &MetadataStore,
    disk: &DiskTier,
    cold: Option<&ColdTier>,
) -> StorageResult<RecoveryReport> {
    let mut report = RecoveryReport::default();

    if let Some(cold) = cold {
        for provider in cold.providers() {
            let entries = match provider.scan().await {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::error!("Recovery: cannot list cold storage {}: {}", provider.id(), e);
                    continue;
                }
            };
            for entry in entries {
                let valid = match provider.get_block(&entry.hash, &entry.cold_path).await {
                    Ok(raw) => validate(&entry.hash, &raw),
                    Err(e) => Err(e),
                };
                if let Err(e) = valid {
                    tracing::warn!("Recovery: skipping cold block {} at {}: {}", entry.hash, entry.cold_path, e);
                    report.skipped += 1;
                    continue;
                }
                metadata.put_bwr(&BlockWhereRecord::in_cold(&entry.hash, &entry.cold_path))?;
                report.recovered += 1;
            }
        }
    }

    for volume in disk.volumes() {
        let blocks = match fsutil::walk_blocks(volume.path(), volume.layout().prefix) {
            Ok(blocks) => blocks,
            Err(e) => {
                tracing::error!("Recovery: cannot walk volume {}: {}", volume.path().display(), e);
                continue;
            }
        };
        for block in blocks {
            let valid = volume
                .read_raw(&block.path)
                .and_then(|raw| validate(&block.hash, &raw));
            if let Err(e) = valid {
                tracing::warn!("Recovery: skipping {}: {}", block.path.display(), e);
                report.skipped += 1;
                continue;
            }

            match metadata.get_bwr(&block.hash)? {
                Some(existing) if existing.tiering.has_cold() => {
                    metadata.put_bwr(&BlockWhereRecord {
                        tiering: Tiering::DiskAndCold,
                        block_path: block.path.display().to_string(),
                        ..existing
                    })?;
                    report.merged += 1;
                }
                _ => {
                    metadata.put_bwr(&BlockWhereRecord::on_disk(&block.hash, &block.path))?;
                    if cold.is_some() {
                        let created_at = DateTime::<Utc>::from(block.modified);
                        metadata.add_unmoved(&UnmovedBlockRecord::new(&block.hash, created_at))?;
                    }
                    report.recovered += 1;
                }
            }
        }
    }

    tracing::info!(
        "Recovery finished: {} recovered, {} merged, {} skipped",
        report.recovered,
        report.merged,
        report.skipped
    );
    Ok(report)
}

fn validate(hash: &str, raw: &[u8]) -> StorageResult<()> {
    let data = codec::decompress(raw)?;
    codec::decode_block_for(hash, &data)?;
    Ok(())
}
