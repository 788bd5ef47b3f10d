// blockstore/src/cache.rs

//! Front cache of serialized blocks with LRU replacement.
//!
//! Access times live in the metadata store's access index, whose front is
//! always the least recently used set. Operations on one hash are
//! serialized through a fixed array of lock shards.

use crate::config::{CacheConfig, WritePolicy};
use crate::metadata::MetadataStore;
use crate::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const LOCK_SHARDS: usize = 64;
const REPLACE_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    blocks_count: u64,
    blocks_size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub path: String,
    pub blocks_count: u64,
    pub blocks_size: u64,
    pub size_limit: u64,
    pub allowed_block_numbers: u64,
}

pub struct Cache {
    path: PathBuf,
    size_limit: u64,
    allowed_block_numbers: u64,
    write_policy: WritePolicy,
    metadata: Arc<MetadataStore>,
    counters: Mutex<Counters>,
    shards: Box<[tokio::sync::Mutex<()>]>,
    replacing: AtomicBool,
}

impl Cache {
    /// Open an empty cache. Anything left from a previous run is discarded.
    pub fn open(config: &CacheConfig, metadata: Arc<MetadataStore>) -> StorageResult<Self> {
        if config.path.is_empty() {
            return Err(StorageError::ConfigError("cache path not provided".into()));
        }
        let path = PathBuf::from(&config.path);
        match fs::remove_dir_all(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&path)?;
        let stale = metadata.clear_cache_access()?;

        tracing::info!(
            "✓ Cache initialized at {} (size limit={}, block limit={}, {} stale entries dropped)",
            path.display(),
            config.size,
            config.allowed_block_numbers,
            stale
        );

        Ok(Self {
            path,
            size_limit: config.size,
            allowed_block_numbers: config.allowed_block_numbers,
            write_policy: config.write_policy,
            metadata,
            counters: Mutex::new(Counters::default()),
            shards: (0..LOCK_SHARDS).map(|_| tokio::sync::Mutex::new(())).collect(),
            replacing: AtomicBool::new(false),
        })
    }

    pub fn write_policy(&self) -> WritePolicy {
        self.write_policy
    }

    fn shard(&self, hash: &str) -> &tokio::sync::Mutex<()> {
        let mut hasher = DefaultHasher::new();
        hash.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    fn file_path(&self, hash: &str) -> PathBuf {
        self.path.join(hash)
    }

    /// Whether the cache has reached one of its ceilings
    pub fn is_full(&self) -> bool {
        let counters = *self.counters.lock();
        (self.allowed_block_numbers > 0 && counters.blocks_count >= self.allowed_block_numbers)
            || (self.size_limit > 0 && counters.blocks_size >= self.size_limit)
    }

    /// Cache a serialized block and mark it as accessed at `at`. The file
    /// and its access record change together under the hash's shard lock.
    ///
    /// A full cache is trimmed first; a failed write is retried once after
    /// another replacement.
    pub async fn write(&self, hash: &str, data: &[u8], at: DateTime<Utc>) -> StorageResult<()> {
        if self.is_full() {
            self.replace().await;
        }

        let first = {
            let _guard = self.shard(hash).lock().await;
            self.write_file(hash, data)
                .and_then(|()| self.metadata.upsert_cache_access(hash, at))
        };
        if let Err(e) = first {
            tracing::warn!("Cache write of {} failed ({}), retrying after replacement", hash, e);
            self.replace().await;
            let _guard = self.shard(hash).lock().await;
            self.write_file(hash, data)?;
            self.metadata.upsert_cache_access(hash, at)?;
        }
        Ok(())
    }

    fn write_file(&self, hash: &str, data: &[u8]) -> StorageResult<()> {
        let path = self.file_path(hash);
        let previous = match fs::metadata(&path) {
            Ok(meta) => Some(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = fs::write(&path, data) {
            let _ = fs::remove_file(&path);
            if let Some(size) = previous {
                self.release(size);
            }
            return Err(e.into());
        }

        let mut counters = self.counters.lock();
        match previous {
            Some(size) => {
                counters.blocks_size = counters.blocks_size.saturating_sub(size) + data.len() as u64;
            }
            None => {
                counters.blocks_count += 1;
                counters.blocks_size += data.len() as u64;
            }
        }
        Ok(())
    }

    /// Cached bytes of a block, refreshing its access time on a hit
    pub async fn read(&self, hash: &str) -> StorageResult<Option<Vec<u8>>> {
        let _guard = self.shard(hash).lock().await;
        let data = match fs::read(self.file_path(hash)) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        self.metadata.upsert_cache_access(hash, Utc::now())?;
        Ok(Some(data))
    }

    /// Drop a block from the cache. Returns whether a file was removed.
    pub async fn remove(&self, hash: &str) -> StorageResult<bool> {
        let _guard = self.shard(hash).lock().await;
        let path = self.file_path(hash);
        let removed = match fs::metadata(&path) {
            Ok(meta) => {
                fs::remove_file(&path)?;
                self.release(meta.len());
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        self.metadata.delete_cache_access(hash)?;
        Ok(removed)
    }

    fn release(&self, size: u64) {
        let mut counters = self.counters.lock();
        counters.blocks_count = counters.blocks_count.saturating_sub(1);
        counters.blocks_size = counters.blocks_size.saturating_sub(size);
    }

    /// Evict the least recently used half of the cache.
    ///
    /// Only one replacement runs at a time; a concurrent call returns 0
    /// immediately.
    pub async fn replace(&self) -> usize {
        if self
            .replacing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return 0;
        }

        let removed = self.evict_oldest_half().await;
        self.replacing.store(false, Ordering::SeqCst);
        removed
    }

    async fn evict_oldest_half(&self) -> usize {
        let total = match self.metadata.cache_access_count() {
            Ok(total) => total as usize,
            Err(e) => {
                tracing::error!("Cache replacement aborted: {}", e);
                return 0;
            }
        };
        if total == 0 {
            return 0;
        }

        let victims = match self.metadata.oldest_cache_access((total / 2).max(1)) {
            Ok(victims) => victims,
            Err(e) => {
                tracing::error!("Cache replacement aborted: {}", e);
                return 0;
            }
        };

        let removed = AtomicUsize::new(0);
        stream::iter(victims)
            .for_each_concurrent(REPLACE_CONCURRENCY, |record| {
                let removed = &removed;
                async move {
                    match self.remove(&record.hash).await {
                        Ok(true) => {
                            removed.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(false) => {}
                        Err(e) => tracing::warn!("Failed to evict {} from cache: {}", record.hash, e),
                    }
                }
            })
            .await;

        let removed = removed.into_inner();
        tracing::info!("Cache replacement removed {} of {} block(s)", removed, total);
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let counters = *self.counters.lock();
        CacheStats {
            path: self.path.display().to_string(),
            blocks_count: counters.blocks_count,
            blocks_size: counters.blocks_size,
            size_limit: self.size_limit,
            allowed_block_numbers: self.allowed_block_numbers,
        }
    }
}
