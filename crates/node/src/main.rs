// node/src/main.rs
use clap::{Parser, Subcommand};
use sharder_node::{Node, NodeConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sharder-node")]
#[command(about = "Sharder block storage node", version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sharder node
    Start {
        /// Configuration file path
        #[arg(short, long, default_value = "./config.toml")]
        config: String,

        /// Override data directory; storage paths under the configured one move with it
        #[arg(long)]
        data_dir: Option<String>,

        /// Override startup mode: start wipes the store, restart resumes it, recover rebuilds metadata
        #[arg(short, long)]
        mode: Option<String>,
    },

    /// Initialize a new node
    Init {
        /// Data directory
        #[arg(long, default_value = "./data")]
        data_dir: String,

        /// Store the genesis block on first start
        #[arg(short, long)]
        genesis: bool,
    },

    /// Store a block read from a JSON file
    Put {
        #[arg(short, long, default_value = "./config.toml")]
        config: String,

        /// Block JSON file
        file: String,
    },

    /// Print a stored block as JSON
    Get {
        #[arg(short, long, default_value = "./config.toml")]
        config: String,

        hash: String,

        #[arg(short, long)]
        round: i64,
    },

    /// Show where a block is stored
    Inspect {
        #[arg(short, long, default_value = "./config.toml")]
        config: String,

        hash: String,
    },

    /// Show storage statistics
    Stats {
        #[arg(short, long, default_value = "./config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Start { config, .. }
        | Commands::Put { config, .. }
        | Commands::Get { config, .. }
        | Commands::Inspect { config, .. }
        | Commands::Stats { config } => Some(NodeConfig::from_file(config)?),
        Commands::Init { .. } => None,
    };

    // Initialize logging
    let log_level = if cli.debug {
        "debug".to_string()
    } else {
        config.as_ref().map(|c| c.log_level.clone()).unwrap_or_else(|| "info".into())
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("sharder_node={0},blockstore={0}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match (cli.command, config) {
        (Commands::Start { data_dir, mode, .. }, Some(config)) => {
            start_node(config, data_dir, mode).await?;
        }
        (Commands::Init { data_dir, genesis }, _) => {
            init_node(&data_dir, genesis).await?;
        }
        (Commands::Put { file, .. }, Some(config)) => {
            put_block(config, &file).await?;
        }
        (Commands::Get { hash, round, .. }, Some(config)) => {
            let node = open_offline(config).await?;
            let block = node.get_block(&hash, round).await?;
            println!("{}", serde_json::to_string_pretty(&block)?);
        }
        (Commands::Inspect { hash, .. }, Some(config)) => {
            let node = open_offline(config).await?;
            match node.store().metadata().get_bwr(&hash)? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => anyhow::bail!("block {} is not stored", hash),
            }
        }
        (Commands::Stats { .. }, Some(config)) => {
            let node = open_offline(config).await?;
            println!("{}", serde_json::to_string_pretty(&node.stats()?)?);
        }
        (_, None) => anyhow::bail!("no configuration loaded"),
    }

    Ok(())
}

async fn start_node(mut config: NodeConfig, data_dir_override: Option<String>, mode: Option<String>) -> anyhow::Result<()> {
    if let Some(data_dir) = data_dir_override {
        config.set_data_dir(&data_dir);
    }
    if let Some(mode) = mode {
        config.storage.mode = mode.parse()?;
    }

    tracing::info!("Starting node with data directory: {}", config.data_dir);

    let genesis_path = format!("{}/genesis.json", config.data_dir);
    let node = Node::new(config).await?;
    if std::path::Path::new(&genesis_path).exists() {
        let genesis = read_block(&genesis_path)?;
        if node.store().metadata().get_bwr(&genesis.hash)?.is_none() {
            node.store_block(&genesis).await?;
            tracing::info!("Genesis block stored");
        }
    }
    node.start().await?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    node.stop().await?;
    tracing::info!("Node stopped gracefully");

    Ok(())
}

async fn init_node(data_dir: &str, create_genesis: bool) -> anyhow::Result<()> {
    tracing::info!("Initializing node at {}", data_dir);

    std::fs::create_dir_all(data_dir)?;
    let config = Node::initialize(NodeConfig::for_data_dir(data_dir)).await?;

    if create_genesis {
        tracing::info!("Creating genesis block");
        let genesis = blockchain_core::Block::genesis();
        std::fs::write(
            format!("{}/genesis.json", config.data_dir),
            serde_json::to_string_pretty(&genesis)?,
        )?;
        tracing::info!("Genesis block created");
    }

    config.to_file(format!("{}/config.toml", config.data_dir))?;

    tracing::info!("Node initialized successfully at {}", config.data_dir);
    tracing::info!("Edit {}/config.toml to configure your node", config.data_dir);

    Ok(())
}

async fn put_block(config: NodeConfig, file: &str) -> anyhow::Result<()> {
    let block = read_block(file)?;
    let node = open_offline(config).await?;
    let record = node.store_block(&block).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

/// Open the existing store without wiping it and without background workers
async fn open_offline(mut config: NodeConfig) -> anyhow::Result<Node> {
    config.storage.mode = blockstore::StartupMode::Restart;
    Node::new(config).await
}

fn read_block(path: &str) -> anyhow::Result<blockchain_core::Block> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}
