#![forbid(unsafe_code)]
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use timpal::blockchain::Ledger;
use timpal::config::load_config;
use timpal::crypto::{address_to_hex, KeyPair};
use timpal::node::Node;
use timpal::persistence::FileStore;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the node configuration
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
    /// Overrides storage.data_dir
    #[arg(long)]
    data_dir: Option<String>,
    /// Overrides network.p2p_port
    #[arg(long)]
    port: Option<u16>,
    /// Extra bootstrap peer as host:port, may be repeated
    #[arg(long = "peer")]
    peers: Vec<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Print height, tip and emission of the local chain as JSON
    Info,
    /// Generate a new device key
    Keygen,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    if let Some(Commands::Keygen) = cli.command {
        let keypair = KeyPair::generate()?;
        println!("address:    {}", address_to_hex(&keypair.address()));
        println!("secret_key: {}", keypair.secret_key.display_secret());
        return Ok(());
    }

    let mut config = load_config(&cli.config)?;
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }
    if let Some(port) = cli.port {
        config.network.p2p_port = port;
    }
    config.network.bootstrap_peers.extend(cli.peers);

    match cli.command {
        Some(Commands::Info) => {
            let store = FileStore::open(&config.storage.data_dir)?;
            let ledger = Ledger::open(config.chain.clone(), &config.genesis.to_spec()?, Box::new(store))?;
            println!("{}", serde_json::to_string_pretty(&ledger.get_chain_info())?);
            Ok(())
        }
        _ => {
            info!(
                "Starting TIMPAL node (chain {}, data dir {})",
                config.chain.chain_id, config.storage.data_dir
            );
            let node = Arc::new(Node::init(config)?);
            node.start().await?;
            Ok(())
        }
    }
}
