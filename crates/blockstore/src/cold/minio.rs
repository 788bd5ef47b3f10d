// blockstore/src/cold/minio.rs

use super::{ColdEntry, ColdStorageProvider};
use crate::codec;
use crate::config::{MinioConfig, StartupMode, VolumeLimits};
use crate::selector::Placement;
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore};
use parking_lot::Mutex;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    blocks_count: u64,
    blocks_size: u64,
}

/// S3-compatible bucket. Objects are keyed by block hash and recorded with
/// the cold path `<endpoint>:<bucket>`.
pub struct MinioProvider {
    store: Arc<dyn ObjectStore>,
    id: String,
    limits: VolumeLimits,
    timeout: Duration,
    counters: Mutex<Counters>,
}

impl MinioProvider {
    /// Connect to the bucket and prepare it for the startup mode. The
    /// ceilings are checked separately by [`MinioProvider::check_capacity`].
    pub async fn open(config: &MinioConfig, timeout: Duration, mode: StartupMode) -> StorageResult<Self> {
        mode.ensure_supported()?;

        let store = AmazonS3Builder::new()
            .with_endpoint(endpoint_url(config))
            .with_bucket_name(&config.bucket_name)
            .with_access_key_id(&config.access_id)
            .with_secret_access_key(&config.secret_access_key)
            .with_region(&config.region)
            .with_allow_http(!config.use_ssl)
            .build()?;

        let provider = Self::with_store(
            Arc::new(store),
            cold_path_of(config),
            VolumeLimits {
                allowed_block_numbers: config.allowed_block_numbers,
                allowed_block_size: config.allowed_block_size,
                ..Default::default()
            },
            timeout,
        );

        if mode.wipes_blocks() {
            let removed = provider.clear().await?;
            tracing::info!("Cold storage {} cleared, {} object(s) removed", provider.id, removed);
        } else {
            provider.refresh_counters().await?;
        }

        let counters = *provider.counters.lock();
        tracing::info!(
            "Cold storage {} opened: blocks={}, size={}",
            provider.id,
            counters.blocks_count,
            counters.blocks_size
        );
        Ok(provider)
    }

    /// Fails once the bucket holds its allowed number or size of blocks
    pub fn check_capacity(&self) -> StorageResult<()> {
        let counters = *self.counters.lock();
        if self.count_reached(counters) {
            return Err(StorageError::AllowedCountLimit(self.id.clone()));
        }
        if self.size_reached(counters) {
            return Err(StorageError::AllowedSizeLimit(self.id.clone()));
        }
        Ok(())
    }

    /// Wrap an existing object store
    pub fn with_store(store: Arc<dyn ObjectStore>, id: String, limits: VolumeLimits, timeout: Duration) -> Self {
        Self {
            store,
            id,
            limits,
            timeout,
            counters: Mutex::new(Counters::default()),
        }
    }

    async fn timed<T, F>(&self, operation: &str, fut: F) -> StorageResult<T>
    where
        F: Future<Output = Result<T, object_store::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StorageError::Timeout(format!(
                "{} on {} after {:?}",
                operation, self.id, self.timeout
            ))),
        }
    }

    async fn list_all(&self) -> StorageResult<Vec<ObjectMeta>> {
        self.timed("list", self.store.list(None).try_collect::<Vec<_>>()).await
    }

    async fn clear(&self) -> StorageResult<usize> {
        let objects = self.list_all().await?;
        for meta in &objects {
            self.timed("delete", self.store.delete(&meta.location)).await?;
        }
        *self.counters.lock() = Counters::default();
        Ok(objects.len())
    }

    async fn refresh_counters(&self) -> StorageResult<()> {
        let objects = self.list_all().await?;
        let counters = Counters {
            blocks_count: objects.len() as u64,
            blocks_size: objects.iter().map(|m| m.size as u64).sum(),
        };
        *self.counters.lock() = counters;
        Ok(())
    }

    fn count_reached(&self, counters: Counters) -> bool {
        self.limits.allowed_block_numbers > 0 && counters.blocks_count >= self.limits.allowed_block_numbers
    }

    fn size_reached(&self, counters: Counters) -> bool {
        self.limits.allowed_block_size > 0 && counters.blocks_size >= self.limits.allowed_block_size
    }

    async fn put(&self, hash: &str, bytes: Vec<u8>) -> StorageResult<String> {
        let size = bytes.len() as u64;
        {
            let counters = self.counters.lock();
            if self.count_reached(*counters) {
                return Err(StorageError::AllowedCountLimit(self.id.clone()));
            }
            if self.limits.allowed_block_size > 0
                && counters.blocks_size.saturating_add(size) > self.limits.allowed_block_size
            {
                return Err(StorageError::AllowedSizeLimit(self.id.clone()));
            }
        }

        let location = ObjectPath::from(hash);
        self.timed("put", self.store.put(&location, Bytes::from(bytes).into()))
            .await?;

        let mut counters = self.counters.lock();
        counters.blocks_count += 1;
        counters.blocks_size += size;
        Ok(self.id.clone())
    }
}

#[async_trait]
impl ColdStorageProvider for MinioProvider {
    async fn write_block(&self, hash: &str, data: &[u8]) -> StorageResult<String> {
        let compressed = codec::compress(data)?;
        self.put(hash, compressed).await
    }

    async fn move_block(&self, hash: &str, hot_path: &Path) -> StorageResult<String> {
        let bytes = tokio::fs::read(hot_path).await?;
        self.put(hash, bytes).await
    }

    async fn get_block(&self, hash: &str, _cold_path: &str) -> StorageResult<Vec<u8>> {
        let location = ObjectPath::from(hash);
        let bytes = self
            .timed("get", async {
                let result = self.store.get(&location).await?;
                let bytes = result.bytes().await?;
                Ok::<_, object_store::Error>(bytes)
            })
            .await?;
        Ok(bytes.to_vec())
    }

    async fn exists(&self, hash: &str, _cold_path: &str) -> StorageResult<bool> {
        let location = ObjectPath::from(hash);
        match self.timed("head", self.store.head(&location)).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn scan(&self) -> StorageResult<Vec<ColdEntry>> {
        let mut entries: Vec<ColdEntry> = self
            .list_all()
            .await?
            .into_iter()
            .map(|meta| ColdEntry {
                hash: meta.location.to_string(),
                cold_path: self.id.clone(),
                size: meta.size as u64,
                modified: meta.last_modified,
            })
            .collect();
        entries.sort_by(|a, b| a.hash.cmp(&b.hash));
        Ok(entries)
    }

    fn owns(&self, cold_path: &str) -> bool {
        cold_path == self.id
    }
}

impl Placement for MinioProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_able_to_store_block(&self) -> bool {
        let counters = *self.counters.lock();
        !self.count_reached(counters) && !self.size_reached(counters)
    }

    fn blocks_count(&self) -> u64 {
        self.counters.lock().blocks_count
    }

    fn blocks_size(&self) -> u64 {
        self.counters.lock().blocks_size
    }
}

/// Cold path recorded for blocks stored in this bucket
pub fn cold_path_of(config: &MinioConfig) -> String {
    format!("{}:{}", config.storage_service_url, config.bucket_name)
}

fn endpoint_url(config: &MinioConfig) -> String {
    if config.storage_service_url.contains("://") {
        config.storage_service_url.clone()
    } else {
        let scheme = if config.use_ssl { "https" } else { "http" };
        format!("{}://{}", scheme, config.storage_service_url)
    }
}
