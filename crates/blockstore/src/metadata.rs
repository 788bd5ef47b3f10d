// blockstore/src/metadata.rs

use crate::{StorageError, StorageResult};
use chrono::{DateTime, TimeZone, Utc};
use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Column families of the metadata database
#[derive(Debug, Clone, Copy)]
pub enum ColumnFamily {
    BlockWhere,
    UnmovedBlocks,
    CacheAccess,
    CacheAccessByHash,
}

impl ColumnFamily {
    fn as_str(&self) -> &'static str {
        match self {
            ColumnFamily::BlockWhere => "block_where",
            ColumnFamily::UnmovedBlocks => "unmoved_blocks",
            ColumnFamily::CacheAccess => "cache_access",
            ColumnFamily::CacheAccessByHash => "cache_access_by_hash",
        }
    }

    fn all() -> Vec<Self> {
        vec![
            Self::BlockWhere,
            Self::UnmovedBlocks,
            Self::CacheAccess,
            Self::CacheAccessByHash,
        ]
    }
}

/// Where the copies of a block live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tiering {
    Disk,
    Cold,
    DiskAndCold,
}

impl Tiering {
    pub fn has_disk(&self) -> bool {
        matches!(self, Tiering::Disk | Tiering::DiskAndCold)
    }

    pub fn has_cold(&self) -> bool {
        matches!(self, Tiering::Cold | Tiering::DiskAndCold)
    }
}

/// Current location of a block. One record per stored block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockWhereRecord {
    pub hash: String,
    pub tiering: Tiering,
    /// Hot tier file, empty when the block only lives in cold storage
    pub block_path: String,
    /// Cold location, empty until the block has been migrated
    pub cold_path: String,
}

impl BlockWhereRecord {
    pub fn on_disk(hash: &str, block_path: &Path) -> Self {
        Self {
            hash: hash.to_string(),
            tiering: Tiering::Disk,
            block_path: block_path.display().to_string(),
            cold_path: String::new(),
        }
    }

    pub fn in_cold(hash: &str, cold_path: &str) -> Self {
        Self {
            hash: hash.to_string(),
            tiering: Tiering::Cold,
            block_path: String::new(),
            cold_path: cold_path.to_string(),
        }
    }
}

/// A hot-only block waiting for migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmovedBlockRecord {
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

impl UnmovedBlockRecord {
    pub fn new(hash: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            hash: hash.to_string(),
            created_at,
        }
    }

    fn key(&self) -> Vec<u8> {
        time_key(&self.created_at, &self.hash)
    }
}

/// Last access of a cached block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheAccessRecord {
    pub hash: String,
    pub access_time: DateTime<Utc>,
}

/// Metadata database configuration
#[derive(Debug, Clone)]
pub struct MetadataConfig {
    pub path: String,
    /// Destroy any existing database before opening
    pub wipe: bool,
    pub max_open_files: i32,
    pub write_buffer_size: usize,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            path: "./data/meta".to_string(),
            wipe: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024, // 16 MB
        }
    }
}

/// Durable block locations, the migration queue and the cache access index
pub struct MetadataStore {
    db: Arc<DB>,
    config: MetadataConfig,
}

impl MetadataStore {
    /// Open or create the metadata database
    pub fn open(config: MetadataConfig) -> StorageResult<Self> {
        if config.wipe && Path::new(&config.path).exists() {
            DB::destroy(&Options::default(), &config.path)
                .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
            tracing::info!("Metadata at {} wiped", config.path);
        }

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(config.max_open_files);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.increase_parallelism(num_cpus::get() as i32);

        let cfs: Vec<_> = ColumnFamily::all().iter().map(|cf| cf.as_str()).collect();

        let db = DB::open_cf(&opts, &config.path, &cfs)
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        tracing::info!("Metadata opened at {}", config.path);

        Ok(Self {
            db: Arc::new(db),
            config,
        })
    }

    pub fn path(&self) -> &str {
        &self.config.path
    }

    // ==================== BLOCK WHERE RECORDS ====================

    pub fn put_bwr(&self, record: &BlockWhereRecord) -> StorageResult<()> {
        let cf = self.cf(ColumnFamily::BlockWhere)?;
        let bytes = bincode::serialize(record)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        self.db
            .put_cf(cf, record.hash.as_bytes(), bytes)
            .map_err(|e| StorageError::DatabaseError(e.to_string()))
    }

    pub fn get_bwr(&self, hash: &str) -> StorageResult<Option<BlockWhereRecord>> {
        let cf = self.cf(ColumnFamily::BlockWhere)?;

        match self.db.get_cf(cf, hash.as_bytes())
            .map_err(|e| StorageError::DatabaseError(e.to_string()))? {
            Some(bytes) => {
                let record = bincode::deserialize(&bytes)
                    .map_err(|e| StorageError::SerializationError(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn delete_bwr(&self, hash: &str) -> StorageResult<()> {
        let cf = self.cf(ColumnFamily::BlockWhere)?;
        self.db
            .delete_cf(cf, hash.as_bytes())
            .map_err(|e| StorageError::DatabaseError(e.to_string()))
    }

    pub fn bwr_count(&self) -> StorageResult<u64> {
        let cf = self.cf(ColumnFamily::BlockWhere)?;
        let mut count = 0u64;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item.map_err(|e| StorageError::DatabaseError(e.to_string()))?;
            count += 1;
        }
        Ok(count)
    }

    pub fn all_bwr(&self) -> StorageResult<Vec<BlockWhereRecord>> {
        let cf = self.cf(ColumnFamily::BlockWhere)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item.map_err(|e| StorageError::DatabaseError(e.to_string()))?;
            match bincode::deserialize::<BlockWhereRecord>(&value) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Failed to deserialize block where record: {}", e),
            }
        }
        Ok(records)
    }

    // ==================== UNMOVED BLOCKS ====================

    pub fn add_unmoved(&self, record: &UnmovedBlockRecord) -> StorageResult<()> {
        let cf = self.cf(ColumnFamily::UnmovedBlocks)?;
        self.db
            .put_cf(cf, record.key(), record.hash.as_bytes())
            .map_err(|e| StorageError::DatabaseError(e.to_string()))
    }

    pub fn delete_unmoved(&self, record: &UnmovedBlockRecord) -> StorageResult<()> {
        let cf = self.cf(ColumnFamily::UnmovedBlocks)?;
        self.db
            .delete_cf(cf, record.key())
            .map_err(|e| StorageError::DatabaseError(e.to_string()))
    }

    /// Oldest records created at or before `cutoff`, ascending
    pub fn unmoved_before(&self, cutoff: DateTime<Utc>, limit: usize) -> StorageResult<Vec<UnmovedBlockRecord>> {
        let cf = self.cf(ColumnFamily::UnmovedBlocks)?;
        let cutoff = nanos(&cutoff);
        let mut records = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            if records.len() >= limit {
                break;
            }
            let (key, value) = item.map_err(|e| StorageError::DatabaseError(e.to_string()))?;
            let (created, _) = split_time_key(&key)?;
            if created > cutoff {
                break;
            }
            records.push(UnmovedBlockRecord {
                hash: String::from_utf8_lossy(&value).into_owned(),
                created_at: from_nanos(created),
            });
        }
        Ok(records)
    }

    pub fn unmoved_count(&self) -> StorageResult<u64> {
        let cf = self.cf(ColumnFamily::UnmovedBlocks)?;
        Ok(self.db.iterator_cf(cf, IteratorMode::Start).count() as u64)
    }

    // ==================== CACHE ACCESS INDEX ====================

    /// Move a hash to the most recently used end of the index
    pub fn upsert_cache_access(&self, hash: &str, access_time: DateTime<Utc>) -> StorageResult<()> {
        let cf_access = self.cf(ColumnFamily::CacheAccess)?;
        let cf_by_hash = self.cf(ColumnFamily::CacheAccessByHash)?;

        let mut batch = WriteBatch::default();
        if let Some(previous) = self.cache_access_nanos(hash)? {
            batch.delete_cf(cf_access, raw_time_key(previous, hash));
        }
        let now = nanos(&access_time);
        batch.put_cf(cf_access, raw_time_key(now, hash), b"");
        batch.put_cf(cf_by_hash, hash.as_bytes(), now.to_be_bytes());

        self.db.write(batch)
            .map_err(|e| StorageError::DatabaseError(e.to_string()))
    }

    pub fn delete_cache_access(&self, hash: &str) -> StorageResult<()> {
        let Some(previous) = self.cache_access_nanos(hash)? else {
            return Ok(());
        };
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(ColumnFamily::CacheAccess)?, raw_time_key(previous, hash));
        batch.delete_cf(self.cf(ColumnFamily::CacheAccessByHash)?, hash.as_bytes());
        self.db.write(batch)
            .map_err(|e| StorageError::DatabaseError(e.to_string()))
    }

    pub fn cache_access(&self, hash: &str) -> StorageResult<Option<CacheAccessRecord>> {
        Ok(self.cache_access_nanos(hash)?.map(|n| CacheAccessRecord {
            hash: hash.to_string(),
            access_time: from_nanos(n),
        }))
    }

    /// Least recently used entries first
    pub fn oldest_cache_access(&self, limit: usize) -> StorageResult<Vec<CacheAccessRecord>> {
        let cf = self.cf(ColumnFamily::CacheAccess)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            if records.len() >= limit {
                break;
            }
            let (key, _) = item.map_err(|e| StorageError::DatabaseError(e.to_string()))?;
            let (access, hash) = split_time_key(&key)?;
            records.push(CacheAccessRecord {
                hash,
                access_time: from_nanos(access),
            });
        }
        Ok(records)
    }

    pub fn cache_access_count(&self) -> StorageResult<u64> {
        let cf = self.cf(ColumnFamily::CacheAccessByHash)?;
        Ok(self.db.iterator_cf(cf, IteratorMode::Start).count() as u64)
    }

    pub fn clear_cache_access(&self) -> StorageResult<u64> {
        let mut batch = WriteBatch::default();
        let mut cleared = 0u64;
        for cf_type in [ColumnFamily::CacheAccess, ColumnFamily::CacheAccessByHash] {
            let cf = self.cf(cf_type)?;
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (key, _) = item.map_err(|e| StorageError::DatabaseError(e.to_string()))?;
                batch.delete_cf(cf, key);
                if matches!(cf_type, ColumnFamily::CacheAccessByHash) {
                    cleared += 1;
                }
            }
        }
        self.db.write(batch)
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        Ok(cleared)
    }

    fn cache_access_nanos(&self, hash: &str) -> StorageResult<Option<u64>> {
        let cf = self.cf(ColumnFamily::CacheAccessByHash)?;
        match self.db.get_cf(cf, hash.as_bytes())
            .map_err(|e| StorageError::DatabaseError(e.to_string()))? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into()
                    .map_err(|_| StorageError::Corruption(format!("invalid access time for {}", hash)))?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    // ==================== UTILITY OPERATIONS ====================

    /// Get column family handle
    fn cf(&self, cf_type: ColumnFamily) -> StorageResult<&rocksdb::ColumnFamily> {
        self.db.cf_handle(cf_type.as_str())
            .ok_or_else(|| StorageError::DatabaseError(format!("{} CF not found", cf_type.as_str())))
    }
}

fn nanos(time: &DateTime<Utc>) -> u64 {
    time.timestamp_nanos_opt().unwrap_or(i64::MAX).max(0) as u64
}

fn from_nanos(nanos: u64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos.min(i64::MAX as u64) as i64)
}

/// Key format: timestamp nanos (8 bytes, big endian) + hash, so that
/// iteration order is time order
fn time_key(time: &DateTime<Utc>, hash: &str) -> Vec<u8> {
    raw_time_key(nanos(time), hash)
}

fn raw_time_key(nanos: u64, hash: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + hash.len());
    key.extend_from_slice(&nanos.to_be_bytes());
    key.extend_from_slice(hash.as_bytes());
    key
}

fn split_time_key(key: &[u8]) -> StorageResult<(u64, String)> {
    if key.len() < 8 {
        return Err(StorageError::Corruption("time key too short".into()));
    }
    let (time, hash) = key.split_at(8);
    let mut raw = [0u8; 8];
    raw.copy_from_slice(time);
    Ok((u64::from_be_bytes(raw), String::from_utf8_lossy(hash).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn create_test_store() -> (MetadataStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = MetadataConfig {
            path: temp_dir.path().to_str().unwrap().to_string(),
            ..Default::default()
        };
        let store = MetadataStore::open(config).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_bwr_put_get_delete() {
        let (store, _temp) = create_test_store();
        let record = BlockWhereRecord::on_disk("abc", Path::new("/hot/K0/0/abc.dat"));

        store.put_bwr(&record).unwrap();
        assert_eq!(store.get_bwr("abc").unwrap(), Some(record.clone()));
        assert_eq!(store.bwr_count().unwrap(), 1);

        let moved = BlockWhereRecord {
            tiering: Tiering::DiskAndCold,
            cold_path: "minio:9000:blocks".into(),
            ..record
        };
        store.put_bwr(&moved).unwrap();
        assert_eq!(store.get_bwr("abc").unwrap().unwrap().tiering, Tiering::DiskAndCold);
        assert_eq!(store.bwr_count().unwrap(), 1);

        store.delete_bwr("abc").unwrap();
        assert_eq!(store.get_bwr("abc").unwrap(), None);
    }

    #[test]
    fn test_unmoved_blocks_in_time_order() {
        let (store, _temp) = create_test_store();
        let base = Utc::now() - Duration::hours(1);
        for (offset, hash) in [(30, "c"), (10, "a"), (20, "b"), (50, "late")] {
            store.add_unmoved(&UnmovedBlockRecord::new(hash, base + Duration::minutes(offset))).unwrap();
        }

        let due = store.unmoved_before(base + Duration::minutes(40), 10).unwrap();
        let hashes: Vec<_> = due.iter().map(|r| r.hash.as_str()).collect();
        assert_eq!(hashes, vec!["a", "b", "c"]);
        assert_eq!(due[0].created_at, base + Duration::minutes(10));

        let limited = store.unmoved_before(Utc::now(), 2).unwrap();
        assert_eq!(limited.len(), 2);

        store.delete_unmoved(&due[0]).unwrap();
        assert_eq!(store.unmoved_count().unwrap(), 3);
        assert_eq!(store.unmoved_before(Utc::now(), 10).unwrap()[0].hash, "b");
    }

    #[test]
    fn test_cache_access_reinsertion() {
        let (store, _temp) = create_test_store();
        let base = Utc::now();
        store.upsert_cache_access("x", base).unwrap();
        store.upsert_cache_access("y", base + Duration::seconds(1)).unwrap();
        store.upsert_cache_access("z", base + Duration::seconds(2)).unwrap();

        // touching x makes y the least recently used
        store.upsert_cache_access("x", base + Duration::seconds(3)).unwrap();
        let oldest: Vec<_> = store.oldest_cache_access(10).unwrap().into_iter().map(|r| r.hash).collect();
        assert_eq!(oldest, vec!["y", "z", "x"]);
        assert_eq!(store.cache_access_count().unwrap(), 3);

        store.delete_cache_access("z").unwrap();
        store.delete_cache_access("missing").unwrap();
        assert_eq!(store.oldest_cache_access(1).unwrap()[0].hash, "y");
        assert!(store.cache_access("z").unwrap().is_none());

        assert_eq!(store.clear_cache_access().unwrap(), 2);
        assert!(store.oldest_cache_access(10).unwrap().is_empty());
    }

    #[test]
    fn test_wipe_on_open() {
        let temp = TempDir::new().unwrap();
        let config = MetadataConfig {
            path: temp.path().join("meta").to_str().unwrap().to_string(),
            ..Default::default()
        };
        {
            let store = MetadataStore::open(config.clone()).unwrap();
            store.put_bwr(&BlockWhereRecord::in_cold("h", "cold")).unwrap();
        }
        {
            let store = MetadataStore::open(config.clone()).unwrap();
            assert!(store.get_bwr("h").unwrap().is_some());
        }
        let store = MetadataStore::open(MetadataConfig { wipe: true, ..config }).unwrap();
        assert!(store.get_bwr("h").unwrap().is_none());
    }
}
