// blockstore/src/cold/disk.rs

use super::{ColdEntry, ColdStorageProvider};
use crate::fsutil;
use crate::selector::Placement;
use crate::volume::Volume;
use crate::StorageResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;

/// Archival disk. Shares the hot volume layout with a wider fan-out; the
/// cold path of a block is its file path.
pub struct ColdDisk {
    volume: Arc<Volume>,
}

impl ColdDisk {
    pub fn new(volume: Arc<Volume>) -> Self {
        Self { volume }
    }

    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }
}

#[async_trait]
impl ColdStorageProvider for ColdDisk {
    async fn write_block(&self, hash: &str, data: &[u8]) -> StorageResult<String> {
        let path = self.volume.write(hash, data)?;
        Ok(path.display().to_string())
    }

    async fn move_block(&self, hash: &str, hot_path: &Path) -> StorageResult<String> {
        let bytes = tokio::fs::read(hot_path).await?;
        let path = self.volume.store_compressed(hash, &bytes)?;
        Ok(path.display().to_string())
    }

    async fn get_block(&self, _hash: &str, cold_path: &str) -> StorageResult<Vec<u8>> {
        self.volume.read_raw(Path::new(cold_path))
    }

    async fn exists(&self, _hash: &str, cold_path: &str) -> StorageResult<bool> {
        Ok(tokio::fs::try_exists(cold_path).await?)
    }

    async fn scan(&self) -> StorageResult<Vec<ColdEntry>> {
        let layout = self.volume.layout();
        Ok(fsutil::walk_blocks(self.volume.path(), layout.prefix)?
            .into_iter()
            .map(|block| ColdEntry {
                cold_path: block.path.display().to_string(),
                hash: block.hash,
                size: block.size,
                modified: DateTime::<Utc>::from(block.modified),
            })
            .collect())
    }

    fn owns(&self, cold_path: &str) -> bool {
        self.volume.owns(Path::new(cold_path))
    }
}

impl Placement for ColdDisk {
    fn id(&self) -> &str {
        self.volume.id()
    }

    fn is_able_to_store_block(&self) -> bool {
        self.volume.is_able_to_store_block()
    }

    fn blocks_count(&self) -> u64 {
        self.volume.blocks_count()
    }

    fn blocks_size(&self) -> u64 {
        self.volume.blocks_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::config::{StartupMode, VolumeLimits};
    use crate::volume::{COLD_LAYOUT, HOT_LAYOUT};
    use tempfile::TempDir;

    fn create_test_disk(temp: &TempDir) -> ColdDisk {
        let volume = Volume::open(temp.path().join("cold"), VolumeLimits::default(), COLD_LAYOUT, StartupMode::Start).unwrap();
        ColdDisk::new(Arc::new(volume))
    }

    #[tokio::test]
    async fn test_move_copies_compressed_bytes() {
        let temp = TempDir::new().unwrap();
        let hot = Volume::open(temp.path().join("hot"), VolumeLimits::default(), HOT_LAYOUT, StartupMode::Start).unwrap();
        let hot_path = hot.write("abc", b"payload").unwrap();
        let disk = create_test_disk(&temp);

        let cold_path = disk.move_block("abc", &hot_path).await.unwrap();
        assert!(cold_path.ends_with("CK0/0/abc.dat"));
        assert!(disk.owns(&cold_path));
        assert!(!disk.owns(&hot_path.display().to_string()));
        assert_eq!(
            disk.get_block("abc", &cold_path).await.unwrap(),
            std::fs::read(&hot_path).unwrap()
        );
        assert!(disk.exists("abc", &cold_path).await.unwrap());
        assert_eq!(disk.blocks_count(), 1);
    }

    #[tokio::test]
    async fn test_scan_lists_cold_blocks() {
        let temp = TempDir::new().unwrap();
        let disk = create_test_disk(&temp);
        disk.write_block("bb", b"second").await.unwrap();
        disk.write_block("aa", b"first").await.unwrap();

        let entries = disk.scan().await.unwrap();
        let hashes: Vec<_> = entries.iter().map(|e| e.hash.as_str()).collect();
        assert_eq!(hashes, vec!["aa", "bb"]);

        let raw = disk.get_block("aa", &entries[0].cold_path).await.unwrap();
        assert_eq!(codec::decompress(&raw).unwrap(), b"first");
    }
}
