// node/src/runtime.rs
use crate::NodeConfig;
use blockchain_core::{Block, Round};
use blockstore::{BlockStore, BlockWhereRecord, StartupMode, StoreStats, Workers};
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct Node {
    config: NodeConfig,
    store: Arc<BlockStore>,
    workers: Mutex<Option<Workers>>,
}

impl Node {
    pub async fn new(config: NodeConfig) -> anyhow::Result<Self> {
        tracing::info!("Initializing node components");

        let store = Arc::new(BlockStore::open(config.storage.clone()).await?);
        tracing::info!(
            "✓ Block store opened: mode={}, topology={:?}",
            config.storage.mode.as_str(),
            config.storage.topology
        );

        Ok(Self {
            config,
            store,
            workers: Mutex::new(None),
        })
    }

    /// Lay out an empty store for `config` and return the configuration
    /// later starts should use: it resumes the store instead of wiping it.
    pub async fn initialize(mut config: NodeConfig) -> anyhow::Result<NodeConfig> {
        config.storage.mode = StartupMode::Start;
        let node = Self::new(config.clone()).await?;
        drop(node);

        config.storage.mode = StartupMode::Restart;
        tracing::info!("✓ Storage laid out, later starts use mode={}", config.storage.mode.as_str());
        Ok(config)
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        tracing::info!("Starting sharder node");

        let mut workers = self.workers.lock().await;
        if workers.is_some() {
            anyhow::bail!("node is already running");
        }
        *workers = Some(self.store.start_workers());
        drop(workers);

        let stats = self.store.stats()?;
        tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        tracing::info!("  🚀 Sharder is fully operational!");
        tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        tracing::info!("  Topology:  {:?}", stats.topology);
        tracing::info!("  Volumes:   {}", stats.volumes.len());
        if !stats.cold_storages.is_empty() {
            tracing::info!("  Cold:      {}", stats.cold_storages.len());
        }
        tracing::info!("  Blocks:    {}", stats.blocks);
        tracing::info!("  Data Dir:  {}", self.config.data_dir);
        tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        tracing::info!("Shutting down node...");

        if let Some(workers) = self.workers.lock().await.take() {
            workers.shutdown().await;
        }

        tracing::info!("Node shutdown complete");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.workers.lock().await.is_some()
    }

    /// Verify the block hash, then persist it
    pub async fn store_block(&self, block: &Block) -> anyhow::Result<BlockWhereRecord> {
        block.validate()?;
        let record = self.store.write(block).await?;
        tracing::debug!("📦 Block #{} stored at {}", block.round, record.block_path);
        Ok(record)
    }

    pub async fn get_block(&self, hash: &str, round: Round) -> anyhow::Result<Block> {
        Ok(self.store.read(hash, round).await?)
    }

    pub fn stats(&self) -> anyhow::Result<StoreStats> {
        Ok(self.store.stats()?)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }
}
