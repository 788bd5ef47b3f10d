// blockstore/src/workers.rs

//! Background loops: cold migration, pool revival and cache replacement.
//!
//! Each worker ticks on its own interval and observes shutdown only between
//! ticks, so a migration batch or cache replacement in flight always runs to
//! completion.

use crate::store::BlockStore;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

pub struct Workers {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    /// Spawn the workers the store's topology needs
    pub fn spawn(store: Arc<BlockStore>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let mut handles = Vec::new();
        let config = store.config().clone();

        if let Some(disk) = &config.disk {
            let store = store.clone();
            handles.push(spawn_periodic("Volume revival", disk.revival_interval(), rx.clone(), move || {
                let store = store.clone();
                async move {
                    let revived = store.disk().revive();
                    if revived > 0 {
                        tracing::info!("{} volume(s) revived", revived);
                    }
                }
            }));
        }

        if let (Some(cold), Some(cold_config)) = (store.cold(), &config.cold) {
            let store_for_tiering = store.clone();
            let batch_size = cold_config.batch_size;
            let settle_window = chrono::Duration::from_std(cold_config.settle_window()).unwrap_or_else(|_| chrono::Duration::zero());
            handles.push(spawn_periodic(
                "Tiering",
                cold_config.block_movement_interval(),
                rx.clone(),
                move || {
                    let store = store_for_tiering.clone();
                    async move {
                        let cutoff = Utc::now() - settle_window;
                        if let Err(e) = store.migrate_batch(cutoff, batch_size).await {
                            tracing::error!("Tiering tick failed: {}", e);
                        }
                    }
                },
            ));

            let store_for_revival = store.clone();
            handles.push(spawn_periodic(
                "Cold storage revival",
                cold_config.revival_interval(),
                rx.clone(),
                move || {
                    let store = store_for_revival.clone();
                    async move {
                        if let Some(cold) = store.cold() {
                            let revived = cold.revive();
                            if revived > 0 {
                                tracing::info!("{} cold storage(s) revived", revived);
                            }
                        }
                    }
                },
            ));
            tracing::debug!("Cold workers started for {} provider(s)", cold.providers().len());
        }

        if let (Some(cache), Some(cache_config)) = (store.cache(), &config.cache) {
            let cache = cache.clone();
            handles.push(spawn_periodic(
                "Cache replacement",
                cache_config.replacement_interval(),
                rx.clone(),
                move || {
                    let cache = cache.clone();
                    async move {
                        if cache.is_full() {
                            cache.replace().await;
                        }
                    }
                },
            ));
        }

        tracing::info!("✓ {} background worker(s) started", handles.len());
        Self { shutdown, handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal every worker and wait for the current ticks to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!("Worker terminated abnormally: {}", e);
            }
        }
        tracing::info!("Background workers stopped");
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("{} worker stopped", name);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ColdConfig, DiskConfig, StartupMode, StorageConfig, Topology, VolumeConfig};
    use crate::metadata::Tiering;
    use blockchain_core::Block;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_tiering_worker_moves_blocks() {
        let temp = TempDir::new().unwrap();
        let dir = |name: &str| temp.path().join(name).to_str().unwrap().to_string();
        let config = StorageConfig {
            mode: StartupMode::Start,
            topology: Topology::DiskAndCold,
            metadata_path: dir("meta"),
            disk: Some(DiskConfig {
                volumes: vec![VolumeConfig::new(dir("hot"))],
                ..Default::default()
            }),
            cache: None,
            cold: Some(ColdConfig {
                volumes: vec![VolumeConfig::new(dir("cold"))],
                block_movement_interval_ms: 20,
                ..Default::default()
            }),
        };
        let store = Arc::new(BlockStore::open(config).await.unwrap());
        let block = Block::new(1, "00".repeat(32), "miner-1", vec![1; 64]);
        store.write(&block).await.unwrap();

        let workers = store.start_workers();
        assert_eq!(workers.len(), 3);

        let mut migrated = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if store.metadata().unmoved_count().unwrap() == 0 {
                migrated = true;
                break;
            }
        }
        workers.shutdown().await;

        assert!(migrated);
        let record = store.metadata().get_bwr(&block.hash).unwrap().unwrap();
        assert_eq!(record.tiering, Tiering::DiskAndCold);
    }

    #[tokio::test]
    async fn test_shutdown_without_ticks() {
        let temp = TempDir::new().unwrap();
        let config = StorageConfig {
            metadata_path: temp.path().join("meta").to_str().unwrap().to_string(),
            disk: Some(DiskConfig {
                volumes: vec![VolumeConfig::new(temp.path().join("hot").to_str().unwrap())],
                revival_interval_ms: 3_600_000,
                ..Default::default()
            }),
            ..Default::default()
        };
        let store = Arc::new(BlockStore::open(config).await.unwrap());
        let workers = store.start_workers();
        assert_eq!(workers.len(), 1);
        tokio::time::timeout(Duration::from_secs(5), workers.shutdown()).await.unwrap();
    }
}
