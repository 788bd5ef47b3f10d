// blockstore/src/config.rs

use crate::{StorageError, StorageResult, GB};
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// How on-disk state is treated when the engine starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupMode {
    /// Wipe every configured path and start empty
    #[default]
    Start,
    /// Reuse on-disk blocks, index files and metadata
    Restart,
    /// Metadata is lost; rebuild it from the block files
    Recover,
    Repair,
    RepairAndRecover,
}

impl StartupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartupMode::Start => "start",
            StartupMode::Restart => "restart",
            StartupMode::Recover => "recover",
            StartupMode::Repair => "repair",
            StartupMode::RepairAndRecover => "repair_and_recover",
        }
    }

    /// Repair modes are reserved and rejected up front
    pub fn ensure_supported(&self) -> StorageResult<()> {
        match self {
            StartupMode::Repair | StartupMode::RepairAndRecover => Err(StorageError::NotSupported(
                format!("startup mode '{}'", self.as_str()),
            )),
            _ => Ok(()),
        }
    }

    /// Whether existing block files and metadata must be discarded
    pub fn wipes_blocks(&self) -> bool {
        matches!(self, StartupMode::Start)
    }
}

impl FromStr for StartupMode {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(StartupMode::Start),
            "restart" => Ok(StartupMode::Restart),
            "recover" => Ok(StartupMode::Recover),
            "repair" => Ok(StartupMode::Repair),
            "repair_and_recover" => Ok(StartupMode::RepairAndRecover),
            other => Err(StorageError::ConfigError(format!("unknown startup mode '{}'", other))),
        }
    }
}

/// Which tiers participate in storing blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    #[default]
    DiskOnly,
    CacheAndDisk,
    DiskAndCold,
    CacheDiskAndCold,
}

impl Topology {
    pub fn has_cache(&self) -> bool {
        matches!(self, Topology::CacheAndDisk | Topology::CacheDiskAndCold)
    }

    pub fn has_cold(&self) -> bool {
        matches!(self, Topology::DiskAndCold | Topology::CacheDiskAndCold)
    }
}

/// Placement strategy used by the hot and cold selectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Random,
    #[default]
    RoundRobin,
    MinSizeFirst,
    MinCountFirst,
    FillFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// Cache is written before the hot tier, as part of the write
    #[default]
    WriteThrough,
    /// Cache is written in the background after the hot tier
    WriteBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementPolicy {
    #[default]
    Lru,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColdStorageType {
    #[default]
    Disk,
    Minio,
}

/// Top level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub mode: StartupMode,
    pub topology: Topology,
    /// Directory of the metadata database
    pub metadata_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cold: Option<ColdConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StartupMode::Start,
            topology: Topology::DiskOnly,
            metadata_path: "./data/meta".to_string(),
            disk: Some(DiskConfig {
                volumes: vec![VolumeConfig::new("./data/hot")],
                ..Default::default()
            }),
            cache: None,
            cold: None,
        }
    }
}

impl StorageConfig {
    /// Check that every section the topology needs is present
    pub fn validate(&self) -> StorageResult<()> {
        let disk = self
            .disk
            .as_ref()
            .ok_or_else(|| StorageError::ConfigError("hot storage configuration not provided".into()))?;
        if disk.volumes.is_empty() {
            return Err(StorageError::ConfigError("no hot volumes configured".into()));
        }

        if self.topology.has_cache() && self.cache.is_none() {
            return Err(StorageError::ConfigError("cache storage configuration not provided".into()));
        }

        if self.topology.has_cold() {
            let cold = self
                .cold
                .as_ref()
                .ok_or_else(|| StorageError::ConfigError("cold storage configuration not provided".into()))?;
            match cold.storage_type {
                ColdStorageType::Disk if cold.volumes.is_empty() => {
                    return Err(StorageError::ConfigError("no cold disk volumes configured".into()));
                }
                ColdStorageType::Minio if cold.minio.is_empty() => {
                    return Err(StorageError::ConfigError("no minio providers configured".into()));
                }
                _ => {}
            }
            if cold.batch_size == 0 {
                return Err(StorageError::ConfigError("cold batch_size must be positive".into()));
            }
        }

        Ok(())
    }

    pub fn disk(&self) -> StorageResult<&DiskConfig> {
        self.disk
            .as_ref()
            .ok_or_else(|| StorageError::ConfigError("hot storage configuration not provided".into()))
    }
}

/// One mounted directory of the hot tier or of a cold disk tier
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    pub path: String,
    /// Maximum number of blocks, 0 for no limit
    #[serde(deserialize_with = "deserialize_number")]
    pub allowed_block_numbers: u64,
    /// Maximum compressed block bytes in GiB, 0 for no limit
    #[serde(deserialize_with = "deserialize_number")]
    pub allowed_block_size: u64,
    /// Free space in GiB that must stay available on the filesystem
    #[serde(deserialize_with = "deserialize_number")]
    pub size_to_maintain: u64,
    /// Free inodes that must stay available on the filesystem
    #[serde(deserialize_with = "deserialize_number")]
    pub inodes_to_maintain: u64,
}

impl VolumeConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Limits with every size converted to bytes
    pub fn limits(&self) -> VolumeLimits {
        VolumeLimits {
            allowed_block_numbers: self.allowed_block_numbers,
            allowed_block_size: self.allowed_block_size.saturating_mul(GB),
            size_to_maintain: self.size_to_maintain.saturating_mul(GB),
            inodes_to_maintain: self.inodes_to_maintain,
        }
    }
}

/// Volume ceilings and reserves, all sizes in bytes. Zero disables a check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeLimits {
    pub allowed_block_numbers: u64,
    pub allowed_block_size: u64,
    pub size_to_maintain: u64,
    pub inodes_to_maintain: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    pub strategy: Strategy,
    pub volumes: Vec<VolumeConfig>,
    /// How often evicted volumes are re-tested
    pub revival_interval_ms: u64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::RoundRobin,
            volumes: Vec::new(),
            revival_interval_ms: 60_000,
        }
    }
}

impl DiskConfig {
    pub fn revival_interval(&self) -> Duration {
        Duration::from_millis(self.revival_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub path: String,
    /// Total cached bytes, 0 for no limit
    #[serde(deserialize_with = "deserialize_number")]
    pub size: u64,
    /// Maximum number of cached blocks, 0 for no limit
    #[serde(deserialize_with = "deserialize_number")]
    pub allowed_block_numbers: u64,
    pub write_policy: WritePolicy,
    pub replacement_policy: ReplacementPolicy,
    pub replacement_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: "./data/cache".to_string(),
            size: 512 * 1024 * 1024, // 512 MB
            allowed_block_numbers: 0,
            write_policy: WritePolicy::WriteThrough,
            replacement_policy: ReplacementPolicy::Lru,
            replacement_interval_ms: 60_000,
        }
    }
}

impl CacheConfig {
    pub fn replacement_interval(&self) -> Duration {
        Duration::from_millis(self.replacement_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColdConfig {
    #[serde(rename = "type")]
    pub storage_type: ColdStorageType,
    pub strategy: Strategy,
    /// Remove the hot copy once the cold copy is acknowledged
    pub delete_local: bool,
    pub block_movement_interval_ms: u64,
    /// Minimum block age before migration
    pub settle_window_ms: u64,
    /// Maximum blocks migrated per tick
    pub batch_size: usize,
    /// Deadline for each object store call
    pub timeout_ms: u64,
    pub revival_interval_ms: u64,
    /// Volumes for `type = "disk"`
    pub volumes: Vec<VolumeConfig>,
    /// Buckets for `type = "minio"`
    pub minio: Vec<MinioConfig>,
}

impl Default for ColdConfig {
    fn default() -> Self {
        Self {
            storage_type: ColdStorageType::Disk,
            strategy: Strategy::RoundRobin,
            delete_local: false,
            block_movement_interval_ms: 60_000,
            settle_window_ms: 0,
            batch_size: 1000,
            timeout_ms: 60_000,
            revival_interval_ms: 60_000,
            volumes: Vec::new(),
            minio: Vec::new(),
        }
    }
}

impl ColdConfig {
    pub fn block_movement_interval(&self) -> Duration {
        Duration::from_millis(self.block_movement_interval_ms.max(1))
    }

    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    pub fn revival_interval(&self) -> Duration {
        Duration::from_millis(self.revival_interval_ms.max(1))
    }
}

/// One S3-compatible bucket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MinioConfig {
    pub storage_service_url: String,
    pub access_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub region: String,
    pub use_ssl: bool,
    #[serde(deserialize_with = "deserialize_number")]
    pub allowed_block_numbers: u64,
    /// Maximum stored bytes, 0 for no limit
    #[serde(deserialize_with = "deserialize_number")]
    pub allowed_block_size: u64,
}

impl Default for MinioConfig {
    fn default() -> Self {
        Self {
            storage_service_url: "127.0.0.1:9000".to_string(),
            access_id: String::new(),
            secret_access_key: String::new(),
            bucket_name: "blocks".to_string(),
            region: "us-east-1".to_string(),
            use_ssl: false,
            allowed_block_numbers: 0,
            allowed_block_size: 0,
        }
    }
}

/// Parse capacity values written as plain numbers or products of powers,
/// e.g. `"10^6"` or `"2*1024*1024"`.
pub fn parse_number(expr: &str) -> Result<u64, String> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err("empty number".into());
    }

    let mut product: u64 = 1;
    for factor in expr.split('*') {
        let factor = factor.trim();
        let value = match factor.split_once('^') {
            Some((base, exp)) => {
                let base: u64 = base.trim().parse().map_err(|_| format!("invalid base in '{}'", factor))?;
                let exp: u32 = exp.trim().parse().map_err(|_| format!("invalid exponent in '{}'", factor))?;
                base.checked_pow(exp).ok_or_else(|| format!("'{}' overflows", factor))?
            }
            None => factor.parse().map_err(|_| format!("invalid number '{}'", factor))?,
        };
        product = product.checked_mul(value).ok_or_else(|| format!("'{}' overflows", expr))?;
    }
    Ok(product)
}

fn deserialize_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrExpr {
        Number(u64),
        Expr(String),
    }

    match NumberOrExpr::deserialize(deserializer)? {
        NumberOrExpr::Number(n) => Ok(n),
        NumberOrExpr::Expr(s) => parse_number(&s).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number_expressions() {
        assert_eq!(parse_number("42").unwrap(), 42);
        assert_eq!(parse_number("10^6").unwrap(), 1_000_000);
        assert_eq!(parse_number("2 * 1024 * 1024").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_number("10^3*4").unwrap(), 4000);
        assert!(parse_number("").is_err());
        assert!(parse_number("ten").is_err());
        assert!(parse_number("10^100").is_err());
    }

    #[test]
    fn test_volume_config_accepts_strings() {
        let cfg: VolumeConfig = serde_json::from_str(
            r#"{"path": "/mnt/hot1", "allowed_block_numbers": "10^6", "allowed_block_size": 2}"#,
        )
        .unwrap();
        assert_eq!(cfg.allowed_block_numbers, 1_000_000);
        let limits = cfg.limits();
        assert_eq!(limits.allowed_block_size, 2 * GB);
        assert_eq!(limits.size_to_maintain, 0);
    }

    #[test]
    fn test_validate_requires_topology_sections() {
        let mut cfg = StorageConfig {
            topology: Topology::CacheDiskAndCold,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(StorageError::ConfigError(_))));

        cfg.cache = Some(CacheConfig::default());
        assert!(cfg.validate().is_err());

        cfg.cold = Some(ColdConfig {
            volumes: vec![VolumeConfig::new("/mnt/cold")],
            ..Default::default()
        });
        assert!(cfg.validate().is_ok());

        cfg.disk = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_repair_modes_are_rejected() {
        assert!(StartupMode::Restart.ensure_supported().is_ok());
        assert!(matches!(
            StartupMode::Repair.ensure_supported(),
            Err(StorageError::NotSupported(_))
        ));
        assert!(StartupMode::RepairAndRecover.ensure_supported().is_err());
        assert_eq!("recover".parse::<StartupMode>().unwrap(), StartupMode::Recover);
        assert!("rebuild".parse::<StartupMode>().is_err());
    }

    #[test]
    fn test_strategy_names() {
        let s: Strategy = serde_json::from_str("\"min_count_first\"").unwrap();
        assert_eq!(s, Strategy::MinCountFirst);
        let s: Strategy = serde_json::from_str("\"fill_first\"").unwrap();
        assert_eq!(s, Strategy::FillFirst);
        assert!(serde_json::from_str::<Strategy>("\"largest_first\"").is_err());
    }
}
