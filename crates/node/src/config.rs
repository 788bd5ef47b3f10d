// node/src/config.rs
use blockstore::config::{DiskConfig, VolumeConfig};
use blockstore::StorageConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: String,
    /// Default filter when neither `RUST_LOG` nor `--debug` is given
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub storage: StorageConfig,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::for_data_dir("./data")
    }
}

impl NodeConfig {
    /// Disk-only layout with metadata and one hot volume under `data_dir`
    pub fn for_data_dir(data_dir: &str) -> Self {
        let data_dir = data_dir.trim_end_matches('/');
        Self {
            data_dir: data_dir.to_string(),
            log_level: default_log_level(),
            storage: StorageConfig {
                metadata_path: format!("{}/meta", data_dir),
                disk: Some(DiskConfig {
                    volumes: vec![VolumeConfig::new(format!("{}/hot", data_dir))],
                    ..Default::default()
                }),
                ..Default::default()
            },
        }
    }

    /// Move the node to `data_dir`. Storage paths under the old data
    /// directory follow it; paths elsewhere are left alone.
    pub fn set_data_dir(&mut self, data_dir: &str) {
        let new_dir = data_dir.trim_end_matches('/').to_string();
        let old_dir = std::mem::replace(&mut self.data_dir, new_dir.clone());

        let storage = &mut self.storage;
        let mut paths = vec![&mut storage.metadata_path];
        if let Some(disk) = storage.disk.as_mut() {
            paths.extend(disk.volumes.iter_mut().map(|v| &mut v.path));
        }
        if let Some(cache) = storage.cache.as_mut() {
            paths.push(&mut cache.path);
        }
        if let Some(cold) = storage.cold.as_mut() {
            paths.extend(cold.volumes.iter_mut().map(|v| &mut v.path));
        }
        for path in paths {
            rebase(path, &old_dir, &new_dir);
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

fn rebase(path: &mut String, old_dir: &str, new_dir: &str) {
    let rest = match Path::new(path.as_str()).strip_prefix(old_dir) {
        Ok(rest) => rest.to_path_buf(),
        Err(_) => return,
    };
    *path = if rest.as_os_str().is_empty() {
        new_dir.to_string()
    } else {
        Path::new(new_dir).join(rest).display().to_string()
    };
}
