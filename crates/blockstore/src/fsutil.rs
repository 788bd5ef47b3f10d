// blockstore/src/fsutil.rs

//! Filesystem helpers shared by hot volumes and cold disks.

use crate::{StorageError, StorageResult};
use nix::sys::statvfs::statvfs;
use nix::unistd::{access, AccessFlags};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Extension of block files
pub const BLOCK_FILE_EXT: &str = "dat";

/// Name of the per-volume directory cursor file
pub const INDEX_STATE_FILE: &str = "index.state";

/// Free space and inode counts of the filesystem holding a path
#[derive(Debug, Clone, Copy)]
pub struct DiskStats {
    pub available_bytes: u64,
    pub free_inodes: u64,
    pub total_inodes: u64,
}

pub fn disk_stats(path: &Path) -> StorageResult<DiskStats> {
    let st = statvfs(path).map_err(io::Error::from)?;
    Ok(DiskStats {
        available_bytes: (st.blocks_available() as u64).saturating_mul(st.fragment_size() as u64),
        free_inodes: st.files_free() as u64,
        total_inodes: st.files() as u64,
    })
}

/// Write permission check for the current process
pub fn can_write(path: &Path) -> bool {
    access(path, AccessFlags::W_OK).is_ok()
}

/// Persisted directory cursor of a volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexState {
    pub k_index: usize,
    pub dir_index: usize,
    pub block_count: usize,
}

impl IndexState {
    pub fn new(k_index: usize, dir_index: usize, block_count: usize) -> Self {
        Self { k_index, dir_index, block_count }
    }

    /// Read `k`, `dir` and an optional block count, one per line
    pub fn load(path: &Path) -> StorageResult<Self> {
        let contents = fs::read_to_string(path)?;
        let mut lines = contents.lines().map(str::trim).filter(|l| !l.is_empty());

        let mut field = |name: &str, required: bool| -> StorageResult<usize> {
            match lines.next() {
                Some(line) => line.parse().map_err(|_| {
                    StorageError::Corruption(format!("{}: invalid {} '{}'", path.display(), name, line))
                }),
                None if required => Err(StorageError::Corruption(format!(
                    "{}: missing {}",
                    path.display(),
                    name
                ))),
                None => Ok(0),
            }
        };

        let k_index = field("k index", true)?;
        let dir_index = field("dir index", true)?;
        let block_count = field("block count", false)?;
        Ok(Self { k_index, dir_index, block_count })
    }

    /// Replace the file atomically via a temporary sibling
    pub fn store(&self, path: &Path) -> StorageResult<()> {
        let tmp = path.with_file_name(format!("{}.tmp", INDEX_STATE_FILE));
        {
            let mut file = fs::File::create(&tmp)?;
            write!(file, "{}\n{}\n{}\n", self.k_index, self.dir_index, self.block_count)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Number of regular files in `dir`; a missing directory counts as empty
pub fn count_files(dir: &Path) -> StorageResult<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut count = 0;
    for entry in entries {
        if entry?.file_type()?.is_file() {
            count += 1;
        }
    }
    Ok(count)
}

/// Subdirectories of `dir` named `<prefix><n>`, sorted by `n`
pub fn indexed_dirs(dir: &Path, prefix: &str) -> StorageResult<Vec<(usize, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let index = name
            .to_str()
            .and_then(|n| n.strip_prefix(prefix))
            .and_then(|n| n.parse::<usize>().ok());
        if let Some(index) = index {
            dirs.push((index, entry.path()));
        }
    }
    dirs.sort_by_key(|(index, _)| *index);
    Ok(dirs)
}

/// A block file found under a volume root
#[derive(Debug, Clone)]
pub struct BlockFile {
    pub hash: String,
    pub path: PathBuf,
    pub k_index: usize,
    pub dir_index: usize,
    pub size: u64,
    pub modified: SystemTime,
}

/// Every `<prefix><k>/<dir>/<hash>.dat` file under `root`, in layout order
pub fn walk_blocks(root: &Path, prefix: &str) -> StorageResult<Vec<BlockFile>> {
    let mut blocks = Vec::new();
    for (k_index, k_dir) in indexed_dirs(root, prefix)? {
        for (dir_index, dir) in indexed_dirs(&k_dir, "")? {
            let mut files = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(BLOCK_FILE_EXT) {
                    continue;
                }
                let Some(hash) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                    continue;
                };
                let meta = entry.metadata()?;
                if !meta.is_file() {
                    continue;
                }
                files.push(BlockFile {
                    hash,
                    path,
                    k_index,
                    dir_index,
                    size: meta.len(),
                    modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                });
            }
            files.sort_by(|a, b| a.hash.cmp(&b.hash));
            blocks.extend(files);
        }
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_index_state_roundtrip_and_legacy_format() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(INDEX_STATE_FILE);

        IndexState::new(3, 17, 5).store(&path).unwrap();
        assert_eq!(IndexState::load(&path).unwrap(), IndexState::new(3, 17, 5));
        assert!(!temp.path().join("index.state.tmp").exists());

        fs::write(&path, "1\n2").unwrap();
        assert_eq!(IndexState::load(&path).unwrap(), IndexState::new(1, 2, 0));

        fs::write(&path, "1\n").unwrap();
        assert!(matches!(IndexState::load(&path), Err(StorageError::Corruption(_))));
    }

    #[test]
    fn test_count_files_missing_dir() {
        let temp = TempDir::new().unwrap();
        assert_eq!(count_files(&temp.path().join("nope")).unwrap(), 0);

        fs::write(temp.path().join("a"), b"x").unwrap();
        fs::create_dir(temp.path().join("sub")).unwrap();
        assert_eq!(count_files(temp.path()).unwrap(), 1);
    }

    #[test]
    fn test_walk_blocks_orders_by_layout() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        for (k, d, name) in [("K1", "0", "cc"), ("K0", "10", "bb"), ("K0", "2", "aa"), ("K0", "2", "ab")] {
            let dir = root.join(k).join(d);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join(format!("{}.{}", name, BLOCK_FILE_EXT)), b"data").unwrap();
        }
        fs::write(root.join("K0").join("2").join("stray.tmp"), b"x").unwrap();
        fs::create_dir_all(root.join("other")).unwrap();

        let hashes: Vec<_> = walk_blocks(root, "K").unwrap().into_iter().map(|b| b.hash).collect();
        assert_eq!(hashes, vec!["aa", "ab", "bb", "cc"]);
    }

    #[test]
    fn test_disk_stats_reports_space() {
        let temp = TempDir::new().unwrap();
        let stats = disk_stats(temp.path()).unwrap();
        assert!(stats.available_bytes > 0);
        assert!(can_write(temp.path()));
    }
}
