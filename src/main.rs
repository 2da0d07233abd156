use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ds_chain::config::NodeConfig;
use ds_chain::crypto::{generate_keypair, save_keypair};
use ds_chain::storage::{MetaKey, Storage};

#[derive(Parser)]
#[command(author, version, about = "Directory Service committee node core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a default node configuration file
    GenerateConfig {
        #[arg(short, long, default_value = "config/node.toml")]
        path: PathBuf,
    },
    /// Generate a new Ed25519 keypair for the node
    Keygen {
        #[arg(short, long, default_value = "keys/node.toml")]
        path: PathBuf,
    },
    /// Print the durable chain markers recorded by this node
    Status {
        #[arg(short, long, default_value = "config/node.toml")]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::GenerateConfig { path } => generate_config(path)?,
        Commands::Keygen { path } => keygen(path)?,
        Commands::Status { config } => status(config)?,
    }

    Ok(())
}

fn generate_config(path: PathBuf) -> Result<()> {
    let config = NodeConfig::default();
    config.ensure_directories()?;
    config.save(&path)?;
    info!(?path, "wrote default configuration");
    Ok(())
}

fn keygen(path: PathBuf) -> Result<()> {
    let keypair = generate_keypair();
    save_keypair(&path, &keypair)?;
    info!(?path, "generated node keypair");
    Ok(())
}

fn status(config_path: PathBuf) -> Result<()> {
    let config = NodeConfig::load(&config_path)?;
    let storage = Storage::open(&config.data_dir.join("db"))?;

    let latest_active = storage
        .get_metadata(MetaKey::LatestActiveDsBlockNum)?
        .map(|raw| String::from_utf8_lossy(&raw).into_owned());
    let ds_incompleted = storage
        .get_metadata(MetaKey::DsIncompleted)?
        .map(|raw| String::from_utf8_lossy(&raw).into_owned());

    match latest_active {
        Some(block_num) => {
            println!("latest active DS block: {block_num}");
            if let Ok(num) = block_num.parse::<u64>() {
                if let Some(block) = storage.get_ds_block(num)? {
                    println!("  miner:      {}", block.header.miner_pub_key);
                    println!("  difficulty: {}", block.header.difficulty);
                    println!("  timestamp:  {}", block.header.timestamp);
                }
            }
        }
        None => println!("no DS block recorded yet"),
    }
    match ds_incompleted {
        Some(flag) => println!("DS epoch incomplete flag: {flag}"),
        None => println!("DS epoch incomplete flag unset"),
    }

    Ok(())
}
