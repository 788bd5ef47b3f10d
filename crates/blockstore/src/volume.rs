// blockstore/src/volume.rs

//! A mounted directory holding block files.
//!
//! Blocks are spread over a two-level directory tree,
//! `<root>/<prefix><k>/<dir>/<hash>.dat`, so that no directory ever holds
//! more than `layout.limit` entries. The cursor `(k, dir, dir_block_nums)`
//! only moves forward and wraps back to `K0` when the K space runs out.

use crate::codec;
use crate::config::{StartupMode, VolumeLimits};
use crate::fsutil::{self, IndexState, BLOCK_FILE_EXT, INDEX_STATE_FILE};
use crate::selector::Placement;
use crate::{StorageError, StorageResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Directory fan-out of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirLayout {
    /// Prefix of the first level directories
    pub prefix: &'static str,
    /// Files per directory, directories per K and number of Ks
    pub limit: usize,
}

/// Layout of hot tier volumes
pub const HOT_LAYOUT: DirLayout = DirLayout { prefix: "K", limit: 2000 };

/// Layout of cold disk volumes
pub const COLD_LAYOUT: DirLayout = DirLayout { prefix: "CK", limit: 10000 };

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    blocks_count: u64,
    blocks_size: u64,
}

/// Current placement position of a volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirCursor {
    pub k_index: usize,
    pub dir_index: usize,
    pub dir_block_nums: usize,
}

/// Volume statistics
#[derive(Debug, Clone, Serialize)]
pub struct VolumeStats {
    pub path: String,
    pub blocks_count: u64,
    pub blocks_size: u64,
    pub allowed_block_numbers: u64,
    pub allowed_block_size: u64,
    pub k_index: usize,
    pub dir_index: usize,
    pub dir_block_nums: usize,
}

pub struct Volume {
    path: PathBuf,
    id: String,
    limits: VolumeLimits,
    layout: DirLayout,
    counters: Mutex<Counters>,
    /// Held for the whole eligibility check so the check and the cursor
    /// advance are one critical section. Lock order: cursor, then counters.
    cursor: Mutex<DirCursor>,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("path", &self.path)
            .field("layout", &self.layout)
            .finish()
    }
}

impl Volume {
    /// Open a volume according to the startup mode and verify it has the
    /// configured headroom.
    pub fn open(
        path: impl Into<PathBuf>,
        limits: VolumeLimits,
        layout: DirLayout,
        mode: StartupMode,
    ) -> StorageResult<Self> {
        let volume = Self::load(path, limits, layout, mode)?;
        volume.check_startup_capacity(mode)?;
        Ok(volume)
    }

    /// Prepare a volume for the startup mode without the headroom checks.
    /// A volume loaded this way can still be read even when it may not take
    /// new blocks.
    pub fn load(
        path: impl Into<PathBuf>,
        limits: VolumeLimits,
        layout: DirLayout,
        mode: StartupMode,
    ) -> StorageResult<Self> {
        if layout.limit == 0 {
            return Err(StorageError::ConfigError("directory limit must be positive".into()));
        }
        let path = path.into();
        let volume = Self {
            id: path.display().to_string(),
            path,
            limits,
            layout,
            counters: Mutex::new(Counters::default()),
            cursor: Mutex::new(DirCursor::default()),
        };

        match mode {
            StartupMode::Start => volume.init_empty()?,
            StartupMode::Restart => volume.resume(false)?,
            StartupMode::Recover => volume.resume(true)?,
            StartupMode::Repair | StartupMode::RepairAndRecover => mode.ensure_supported()?,
        }

        let counters = *volume.counters.lock();
        tracing::info!(
            "Volume {} opened ({}): blocks={}, size={}",
            volume.id,
            mode.as_str(),
            counters.blocks_count,
            counters.blocks_size
        );
        Ok(volume)
    }

    fn init_empty(&self) -> StorageResult<()> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&self.path)?;
        IndexState::default().store(&self.index_path())?;
        Ok(())
    }

    /// Pick up where a previous process stopped. In recover mode a missing
    /// index file is rebuilt from the last directory present on disk.
    fn resume(&self, lenient: bool) -> StorageResult<()> {
        fs::create_dir_all(&self.path)?;
        let state = match IndexState::load(&self.index_path()) {
            Ok(state) => state,
            Err(e) if lenient => {
                let state = self.last_position()?;
                tracing::warn!(
                    "Volume {}: index state unusable ({}), resuming at K{}/{}",
                    self.id,
                    e,
                    state.k_index,
                    state.dir_index
                );
                state.store(&self.index_path())?;
                state
            }
            Err(e) => return Err(e),
        };

        let dir_block_nums = fsutil::count_files(&self.dir_path(state.k_index, state.dir_index))?;
        *self.cursor.lock() = DirCursor {
            k_index: state.k_index,
            dir_index: state.dir_index,
            dir_block_nums,
        };

        let mut counters = Counters::default();
        for block in fsutil::walk_blocks(&self.path, self.layout.prefix)? {
            counters.blocks_count += 1;
            counters.blocks_size += block.size;
        }
        *self.counters.lock() = counters;
        Ok(())
    }

    fn last_position(&self) -> StorageResult<IndexState> {
        let Some((k_index, k_dir)) = fsutil::indexed_dirs(&self.path, self.layout.prefix)?.pop() else {
            return Ok(IndexState::default());
        };
        let dir_index = fsutil::indexed_dirs(&k_dir, "")?.pop().map(|(i, _)| i).unwrap_or(0);
        Ok(IndexState::new(k_index, dir_index, 0))
    }

    /// Free space and inode reserves, plus the block ceilings in recover mode
    pub fn check_startup_capacity(&self, mode: StartupMode) -> StorageResult<()> {
        let stats = fsutil::disk_stats(&self.path)?;

        if self.limits.size_to_maintain > 0 && stats.available_bytes <= self.limits.size_to_maintain {
            return Err(StorageError::SizeLimit {
                path: self.id.clone(),
                available: stats.available_bytes,
                reserve: self.limits.size_to_maintain,
            });
        }

        if self.limits.inodes_to_maintain > 0
            && stats.total_inodes > 0
            && stats.free_inodes <= self.limits.inodes_to_maintain
        {
            return Err(StorageError::InodesLimit {
                path: self.id.clone(),
                available: stats.free_inodes,
                reserve: self.limits.inodes_to_maintain,
            });
        }

        if mode == StartupMode::Recover {
            let counters = *self.counters.lock();
            if self.limits.allowed_block_numbers > 0 && counters.blocks_count >= self.limits.allowed_block_numbers {
                return Err(StorageError::AllowedCountLimit(self.id.clone()));
            }
            if self.limits.allowed_block_size > 0 && counters.blocks_size >= self.limits.allowed_block_size {
                return Err(StorageError::AllowedSizeLimit(self.id.clone()));
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> DirLayout {
        self.layout
    }

    pub fn blocks_count(&self) -> u64 {
        self.counters.lock().blocks_count
    }

    pub fn blocks_size(&self) -> u64 {
        self.counters.lock().blocks_size
    }

    pub fn cursor(&self) -> DirCursor {
        *self.cursor.lock()
    }

    fn index_path(&self) -> PathBuf {
        self.path.join(INDEX_STATE_FILE)
    }

    fn dir_path(&self, k_index: usize, dir_index: usize) -> PathBuf {
        self.path
            .join(format!("{}{}", self.layout.prefix, k_index))
            .join(dir_index.to_string())
    }

    fn next_position(&self, k_index: usize, dir_index: usize) -> (usize, usize) {
        if dir_index + 1 < self.layout.limit {
            (k_index, dir_index + 1)
        } else if k_index + 1 < self.layout.limit {
            (k_index + 1, 0)
        } else {
            (0, 0)
        }
    }

    /// Make sure the cursor points at a directory with room for one more
    /// block, advancing and persisting the index state when it does not.
    fn select_dir(&self, cursor: &mut DirCursor) -> StorageResult<()> {
        if cursor.dir_block_nums < self.layout.limit {
            fs::create_dir_all(self.dir_path(cursor.k_index, cursor.dir_index))?;
            return Ok(());
        }

        let (mut k_index, mut dir_index) = (cursor.k_index, cursor.dir_index);
        let positions = self.layout.limit.saturating_mul(self.layout.limit);
        for _ in 1..positions {
            (k_index, dir_index) = self.next_position(k_index, dir_index);
            let dir = self.dir_path(k_index, dir_index);
            let count = fsutil::count_files(&dir)?;
            if count >= self.layout.limit {
                continue;
            }

            fs::create_dir_all(&dir)?;
            IndexState::new(k_index, dir_index, count).store(&self.index_path())?;
            *cursor = DirCursor {
                k_index,
                dir_index,
                dir_block_nums: count,
            };
            tracing::debug!("Volume {} moved to {}{}/{}", self.id, self.layout.prefix, k_index, dir_index);
            return Ok(());
        }

        Err(StorageError::VolumeFull(self.path.clone()))
    }

    /// Whether the next block can be written here. A `true` result has
    /// already created the target directory.
    pub fn is_able_to_store_block(&self) -> bool {
        let mut cursor = self.cursor.lock();
        let counters = *self.counters.lock();

        if self.limits.allowed_block_size > 0 && counters.blocks_size >= self.limits.allowed_block_size {
            tracing::debug!("Volume {} reached allowed block size", self.id);
            return false;
        }
        if self.limits.allowed_block_numbers > 0 && counters.blocks_count >= self.limits.allowed_block_numbers {
            tracing::debug!("Volume {} reached allowed block numbers", self.id);
            return false;
        }

        let stats = match fsutil::disk_stats(&self.path) {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!("Volume {}: statvfs failed: {}", self.id, e);
                return false;
            }
        };
        if self.limits.inodes_to_maintain > 0
            && stats.total_inodes > 0
            && stats.free_inodes <= self.limits.inodes_to_maintain
        {
            tracing::warn!("Volume {}: only {} inodes left", self.id, stats.free_inodes);
            return false;
        }
        if stats.available_bytes < self.limits.size_to_maintain {
            tracing::warn!("Volume {}: only {} bytes left", self.id, stats.available_bytes);
            return false;
        }
        if !fsutil::can_write(&self.path) {
            tracing::warn!("Volume {} is not writable", self.id);
            return false;
        }

        if let Err(e) = self.select_dir(&mut cursor) {
            tracing::warn!("Volume {}: {}", self.id, e);
            return false;
        }
        true
    }

    /// Compress and store a serialized block
    pub fn write(&self, hash: &str, data: &[u8]) -> StorageResult<PathBuf> {
        let compressed = codec::compress(data)?;
        self.store_compressed(hash, &compressed)
    }

    /// Store bytes that are already in block file format
    pub fn store_compressed(&self, hash: &str, bytes: &[u8]) -> StorageResult<PathBuf> {
        let size = bytes.len() as u64;
        let mut cursor = self.cursor.lock();

        {
            let counters = self.counters.lock();
            if self.limits.allowed_block_numbers > 0 && counters.blocks_count >= self.limits.allowed_block_numbers {
                return Err(StorageError::AllowedCountLimit(self.id.clone()));
            }
            if self.limits.allowed_block_size > 0
                && counters.blocks_size.saturating_add(size) > self.limits.allowed_block_size
            {
                return Err(StorageError::AllowedSizeLimit(self.id.clone()));
            }
        }

        self.select_dir(&mut cursor)?;
        let path = self
            .dir_path(cursor.k_index, cursor.dir_index)
            .join(format!("{}.{}", hash, BLOCK_FILE_EXT));

        if let Err(e) = write_file(&path, bytes) {
            // never leave a partial block behind
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }

        cursor.dir_block_nums += 1;
        let mut counters = self.counters.lock();
        counters.blocks_count += 1;
        counters.blocks_size += size;
        Ok(path)
    }

    /// Read and decompress a block file
    pub fn read(&self, path: &Path) -> StorageResult<Vec<u8>> {
        codec::decompress(&self.read_raw(path)?)
    }

    /// Block file bytes as stored, still compressed
    pub fn read_raw(&self, path: &Path) -> StorageResult<Vec<u8>> {
        Ok(fs::read(path)?)
    }

    /// Remove a block file and release its share of the counters
    pub fn delete(&self, path: &Path) -> StorageResult<()> {
        let size = fs::metadata(path)?.len();
        fs::remove_file(path)?;

        let mut counters = self.counters.lock();
        counters.blocks_count = counters.blocks_count.saturating_sub(1);
        counters.blocks_size = counters.blocks_size.saturating_sub(size);
        Ok(())
    }

    /// Whether a block path lives on this volume
    pub fn owns(&self, block_path: &Path) -> bool {
        volume_root(block_path) == Some(self.path.as_path())
    }

    pub fn stats(&self) -> VolumeStats {
        let cursor = self.cursor();
        let counters = *self.counters.lock();
        VolumeStats {
            path: self.id.clone(),
            blocks_count: counters.blocks_count,
            blocks_size: counters.blocks_size,
            allowed_block_numbers: self.limits.allowed_block_numbers,
            allowed_block_size: self.limits.allowed_block_size,
            k_index: cursor.k_index,
            dir_index: cursor.dir_index,
            dir_block_nums: cursor.dir_block_nums,
        }
    }
}

impl Placement for Volume {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_able_to_store_block(&self) -> bool {
        Volume::is_able_to_store_block(self)
    }

    fn blocks_count(&self) -> u64 {
        Volume::blocks_count(self)
    }

    fn blocks_size(&self) -> u64 {
        Volume::blocks_size(self)
    }
}

/// Root of the volume a block path was written to
pub fn volume_root(block_path: &Path) -> Option<&Path> {
    block_path.ancestors().nth(3)
}

fn write_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_data()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    const TEST_LAYOUT: DirLayout = DirLayout { prefix: "K", limit: 2 };

    fn create_test_volume(limits: VolumeLimits) -> (Volume, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let volume = Volume::open(temp_dir.path().join("vol"), limits, TEST_LAYOUT, StartupMode::Start).unwrap();
        (volume, temp_dir)
    }

    fn relative(volume: &Volume, path: &Path) -> String {
        path.strip_prefix(volume.path()).unwrap().display().to_string()
    }

    #[test]
    fn test_write_updates_counters() {
        let (volume, _temp) = create_test_volume(VolumeLimits::default());
        let data = vec![42u8; 4096];

        let path = volume.write("aa", &data).unwrap();
        assert_eq!(relative(&volume, &path), "K0/0/aa.dat");

        let on_disk = fs::metadata(&path).unwrap().len();
        assert_eq!(volume.blocks_count(), 1);
        assert_eq!(volume.blocks_size(), on_disk);
        assert!(on_disk < data.len() as u64);
        assert_eq!(volume.read(&path).unwrap(), data);
        assert_eq!(volume.cursor().dir_block_nums, 1);
    }

    #[test]
    fn test_directory_advance_and_index_state() {
        let (volume, _temp) = create_test_volume(VolumeLimits::default());

        let mut placed = Vec::new();
        for i in 0..5 {
            assert!(volume.is_able_to_store_block());
            let path = volume.write(&format!("h{}", i), b"block").unwrap();
            placed.push(relative(&volume, &path));
        }
        assert_eq!(
            placed,
            vec!["K0/0/h0.dat", "K0/0/h1.dat", "K0/1/h2.dat", "K0/1/h3.dat", "K1/0/h4.dat"]
        );

        let state = IndexState::load(&volume.path().join(INDEX_STATE_FILE)).unwrap();
        assert_eq!((state.k_index, state.dir_index), (1, 0));
    }

    #[test]
    fn test_volume_full_after_whole_space() {
        let (volume, _temp) = create_test_volume(VolumeLimits::default());
        for i in 0..8 {
            volume.write(&format!("h{}", i), b"block").unwrap();
        }

        assert!(!volume.is_able_to_store_block());
        assert!(matches!(volume.write("h8", b"block"), Err(StorageError::VolumeFull(_))));
        assert_eq!(volume.blocks_count(), 8);
    }

    #[test]
    fn test_wraps_to_first_free_directory() {
        let (volume, _temp) = create_test_volume(VolumeLimits::default());
        let mut paths = Vec::new();
        for i in 0..8 {
            paths.push(volume.write(&format!("h{}", i), b"block").unwrap());
        }

        volume.delete(&paths[1]).unwrap();
        assert_eq!(volume.blocks_count(), 7);

        assert!(volume.is_able_to_store_block());
        let path = volume.write("again", b"block").unwrap();
        assert_eq!(relative(&volume, &path), "K0/0/again.dat");
        assert!(volume.cursor().dir_block_nums <= TEST_LAYOUT.limit);
    }

    #[test]
    fn test_allowed_block_numbers() {
        let (volume, _temp) = create_test_volume(VolumeLimits {
            allowed_block_numbers: 3,
            ..Default::default()
        });
        for i in 0..3 {
            volume.write(&format!("h{}", i), b"block").unwrap();
        }
        assert!(!volume.is_able_to_store_block());
        assert!(matches!(volume.write("h3", b"block"), Err(StorageError::AllowedCountLimit(_))));
    }

    #[test]
    fn test_allowed_block_size_checked_at_write() {
        let (volume, _temp) = create_test_volume(VolumeLimits {
            allowed_block_size: 40,
            ..Default::default()
        });
        let big = codec::compress(&[1u8; 64]).unwrap();
        volume.store_compressed("first", &big).unwrap();

        let used = volume.blocks_size();
        let oversize = vec![0u8; (40 - used + 1) as usize];
        assert!(matches!(
            volume.store_compressed("second", &oversize),
            Err(StorageError::AllowedSizeLimit(_))
        ));
        assert_eq!(volume.blocks_count(), 1);
    }

    #[test]
    fn test_delete_and_owns() {
        let (volume, temp) = create_test_volume(VolumeLimits::default());
        let path = volume.write("aa", b"block").unwrap();
        assert!(volume.owns(&path));
        assert!(!volume.owns(&temp.path().join("other/K0/0/aa.dat")));

        volume.delete(&path).unwrap();
        assert_eq!(volume.blocks_count(), 0);
        assert_eq!(volume.blocks_size(), 0);
        assert!(volume.delete(&path).is_err());
    }

    #[test]
    fn test_restart_resumes_cursor_and_counters() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("vol");
        let size = {
            let volume = Volume::open(&root, VolumeLimits::default(), TEST_LAYOUT, StartupMode::Start).unwrap();
            for i in 0..3 {
                volume.write(&format!("h{}", i), b"block").unwrap();
            }
            volume.blocks_size()
        };

        let volume = Volume::open(&root, VolumeLimits::default(), TEST_LAYOUT, StartupMode::Restart).unwrap();
        assert_eq!(volume.blocks_count(), 3);
        assert_eq!(volume.blocks_size(), size);
        assert_eq!(
            volume.cursor(),
            DirCursor { k_index: 0, dir_index: 1, dir_block_nums: 1 }
        );

        let path = volume.write("h3", b"block").unwrap();
        assert_eq!(relative(&volume, &path), "K0/1/h3.dat");
    }

    #[test]
    fn test_restart_requires_index_but_recover_rebuilds_it() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("vol");
        {
            let volume = Volume::open(&root, VolumeLimits::default(), TEST_LAYOUT, StartupMode::Start).unwrap();
            for i in 0..5 {
                volume.write(&format!("h{}", i), b"block").unwrap();
            }
        }
        fs::remove_file(root.join(INDEX_STATE_FILE)).unwrap();

        assert!(Volume::open(&root, VolumeLimits::default(), TEST_LAYOUT, StartupMode::Restart).is_err());

        let volume = Volume::open(&root, VolumeLimits::default(), TEST_LAYOUT, StartupMode::Recover).unwrap();
        assert_eq!(volume.blocks_count(), 5);
        assert_eq!(
            volume.cursor(),
            DirCursor { k_index: 1, dir_index: 0, dir_block_nums: 1 }
        );
    }

    #[test]
    fn test_start_wipes_existing_blocks() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("vol");
        let path = {
            let volume = Volume::open(&root, VolumeLimits::default(), TEST_LAYOUT, StartupMode::Start).unwrap();
            volume.write("h0", b"block").unwrap()
        };
        let volume = Volume::open(&root, VolumeLimits::default(), TEST_LAYOUT, StartupMode::Start).unwrap();
        assert!(!path.exists());
        assert_eq!(volume.blocks_count(), 0);
    }

    #[test]
    fn test_size_reserve_rejects_volume() {
        let temp = TempDir::new().unwrap();
        let limits = VolumeLimits {
            size_to_maintain: u64::MAX,
            ..Default::default()
        };
        let result = Volume::open(temp.path().join("vol"), limits, TEST_LAYOUT, StartupMode::Start);
        assert!(matches!(result, Err(StorageError::SizeLimit { .. })));
    }

    #[test]
    fn test_full_volume_loads_for_reads() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("vol");
        let limits = VolumeLimits {
            allowed_block_numbers: 2,
            ..Default::default()
        };
        let path = {
            let volume = Volume::open(&root, limits, TEST_LAYOUT, StartupMode::Start).unwrap();
            volume.write("h0", b"block").unwrap();
            volume.write("h1", b"block").unwrap()
        };

        assert!(matches!(
            Volume::open(&root, limits, TEST_LAYOUT, StartupMode::Recover),
            Err(StorageError::AllowedCountLimit(_))
        ));

        let volume = Volume::load(&root, limits, TEST_LAYOUT, StartupMode::Recover).unwrap();
        assert_eq!(volume.blocks_count(), 2);
        assert_eq!(volume.read(&path).unwrap(), b"block");
        assert!(!volume.is_able_to_store_block());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_cursor_never_exceeds_limit(ops in proptest::collection::vec(any::<bool>(), 1..24)) {
            let temp = TempDir::new().unwrap();
            let layout = DirLayout { prefix: "K", limit: 3 };
            let volume = Volume::open(temp.path().join("vol"), VolumeLimits::default(), layout, StartupMode::Start).unwrap();
            let mut written: Vec<PathBuf> = Vec::new();

            for (i, write) in ops.into_iter().enumerate() {
                if write || written.is_empty() {
                    if let Ok(path) = volume.write(&format!("h{}", i), b"block") {
                        written.push(path);
                    }
                } else {
                    let path = written.remove(0);
                    volume.delete(&path).unwrap();
                }
                prop_assert!(volume.cursor().dir_block_nums <= layout.limit);
                prop_assert_eq!(volume.blocks_count(), written.len() as u64);
            }

            for path in &written {
                let dir = path.parent().unwrap();
                prop_assert!(fsutil::count_files(dir).unwrap() <= layout.limit);
            }
        }
    }
}
