use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::runtime::Runtime;

use aurum_chain::store::GenesisConfig;
use aurum_config::AurumConfig;
use aurum_core::address::{derive_address, Network};
use aurum_node::{run_node, CoreServices};
use aurum_storage::ChainDisk;

#[derive(Parser)]
#[command(name = "aurum", version, about = "aurum proof-of-work node CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an example config and genesis document
    Init {
        #[arg(long, default_value = "config/aurum.toml")]
        config: PathBuf,
    },
    /// Generate a keypair and print its addresses
    Keygen,
    /// Start the node
    Run {
        #[arg(long, default_value = "config/aurum.toml")]
        config: PathBuf,
    },
    /// Catch up from a peer's snapshot surface, then exit
    Sync {
        #[arg(long, default_value = "config/aurum.toml")]
        config: PathBuf,
        #[arg(long)]
        peer: String,
    },
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Commands::Init { config } => init_config(config),
        Commands::Keygen => keygen(),
        Commands::Run { config } => {
            let rt = Runtime::new()?;
            rt.block_on(async move { run_node(config).await })
        }
        Commands::Sync { config, peer } => sync_from_peer(config, peer),
    }
}

fn init_config(path: PathBuf) -> Result<()> {
    if path.exists() {
        println!("Config already exists at {}", path.display());
        return Ok(());
    }
    let config = AurumConfig::example();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, toml::to_string_pretty(&config)?)?;
    println!("Wrote config to {}", path.display());

    let disk = ChainDisk::open(PathBuf::from(&config.node.data_dir))?;
    if disk.read_json::<GenesisConfig>(&disk.genesis_path())?.is_none() {
        let doc = GenesisConfig::example(Network::Testnet);
        disk.write_json_atomic(&disk.genesis_path(), &doc)?;
        println!("Wrote genesis document to {}", disk.genesis_path().display());
    }
    Ok(())
}

fn keygen() -> Result<()> {
    let keypair = aurum_crypto::generate_keypair();
    let output = serde_json::json!({
        "secret_key": keypair.secret_key,
        "public_key": keypair.public_key,
        "mainnet_address": derive_address(Network::Mainnet, &keypair.public_key)?,
        "testnet_address": derive_address(Network::Testnet, &keypair.public_key)?,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn sync_from_peer(config: PathBuf, peer: String) -> Result<()> {
    aurum_node::init_logging();
    let config = AurumConfig::load(&config)?;
    let services = CoreServices::build(&config)?;
    services.sync_from_peer(&peer)?;
    println!("Synced to height {}", services.store.height());
    Ok(())
}
