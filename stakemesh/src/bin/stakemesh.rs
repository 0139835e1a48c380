//! StakeMesh CLI
//!
//! Command-line interface for the StakeMesh node.
//!
//! # Usage
//!
//! ```bash
//! # Write a devnet config and start a node from it
//! stakemesh --network devnet init
//! stakemesh --network devnet node
//!
//! # Join an existing node
//! stakemesh node --bootstrap 10.0.0.5:7400 --bootstrap framed://10.0.0.6:7401
//!
//! # Generate a new keypair
//! stakemesh keygen
//! ```

use stakemesh::node::config::{default_data_dir, Network};
use stakemesh::node::{BootstrapPeer, Node, NodeConfig};
use stakemesh::types::Address;
use stakemesh_crypto::{Blake3Hasher, Ed25519Keypair, Signer};

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// StakeMesh - proof-of-stake chain node
#[derive(Parser)]
#[command(name = "stakemesh")]
#[command(version)]
#[command(about = "StakeMesh proof-of-stake node and CLI", long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory
    #[arg(short, long, global = true, env = "STAKEMESH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Network (testnet, devnet)
    #[arg(short, long, global = true, default_value = "testnet")]
    network: Network,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a StakeMesh node
    Node(NodeArgs),

    /// Write the network preset to the data directory
    Init(InitArgs),

    /// Generate a node key
    Keygen(KeygenArgs),

    /// Show version
    Version,
}

#[derive(Args)]
struct NodeArgs {
    /// Listen host for both transports
    #[arg(long)]
    listen_host: Option<String>,

    /// Newline-delimited JSON port
    #[arg(long)]
    stream_port: Option<u16>,

    /// Length-prefixed frame port
    #[arg(long)]
    framed_port: Option<u16>,

    /// Bootstrap peer as `[stream|framed://]host:port` (repeatable)
    #[arg(long = "bootstrap")]
    bootstrap: Vec<BootstrapPeer>,

    /// Maximum peers
    #[arg(long)]
    max_peers: Option<usize>,

    /// Validator address this node produces for (default: node key address)
    #[arg(long)]
    validator: Option<Address>,

    /// Produce for every slot owner, not just this node's validator
    #[arg(long)]
    produce_any: bool,

    /// Node key seed (hex, 32 bytes)
    #[arg(long, env = "STAKEMESH_IDENTITY_SEED", hide_env_values = true)]
    identity_seed: Option<String>,

    /// Do not sign outgoing network messages
    #[arg(long)]
    no_sign: bool,
}

#[derive(Args)]
struct InitArgs {
    /// Overwrite an existing config file
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct KeygenArgs {
    /// Write the seed (hex) to this file
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);

    match cli.command {
        Commands::Node(args) => {
            let config = resolve_config(cli.config.as_deref(), data_dir, cli.network)?;
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(run_node(apply_overrides(config, args)))?;
        }
        Commands::Init(args) => run_init(args, data_dir, cli.network)?,
        Commands::Keygen(args) => run_keygen(args)?,
        Commands::Version => run_version(),
    }

    Ok(())
}

/// Explicit `--config`, then `<data_dir>/config.json`, then the preset
fn resolve_config(
    path: Option<&Path>,
    data_dir: PathBuf,
    network: Network,
) -> Result<NodeConfig, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        info!("Loading configuration from {}", path.display());
        return Ok(NodeConfig::load(path)?);
    }

    let default_path = NodeConfig::config_path(&data_dir);
    if default_path.exists() {
        info!("Loading configuration from {}", default_path.display());
        return Ok(NodeConfig::load(&default_path)?);
    }

    Ok(NodeConfig::preset(network, data_dir))
}

fn apply_overrides(mut config: NodeConfig, args: NodeArgs) -> NodeConfig {
    if let Some(host) = args.listen_host {
        config.listen_host = host;
    }
    if let Some(port) = args.stream_port {
        config.stream_port = port;
    }
    if let Some(port) = args.framed_port {
        config.framed_port = port;
    }
    if let Some(max_peers) = args.max_peers {
        config.max_peers = max_peers;
    }
    if args.validator.is_some() {
        config.validator = args.validator;
    }
    if args.identity_seed.is_some() {
        config.identity_seed = args.identity_seed;
    }
    if args.produce_any {
        config.produce_for_any = true;
    }
    if args.no_sign {
        config.sign_messages = false;
    }
    config.bootstrap_peers.extend(args.bootstrap);
    config
}

/// Run the node until Ctrl+C
async fn run_node(config: NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting StakeMesh node...");

    let token = CancellationToken::new();
    let node = match Node::start(config, token.clone()).await {
        Ok(node) => node,
        Err(e) => {
            error!(error = %e, "Node failed to start");
            return Err(e.into());
        }
    };

    info!("Node running. Press Ctrl+C to stop.");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Signal handler failed");
            }
        }
        _ = token.cancelled() => {}
    }

    info!("Shutting down...");
    node.stop().await?;
    Ok(())
}

/// Write the preset config for `network`
fn run_init(
    args: InitArgs,
    data_dir: PathBuf,
    network: Network,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Initializing StakeMesh at {}", data_dir.display());

    let path = NodeConfig::config_path(&data_dir);
    if path.exists() && !args.force {
        return Err(format!("{} already exists. Use --force to overwrite.", path.display()).into());
    }

    let config = NodeConfig::preset(network, data_dir);
    config.validate()?;
    config.save(&path)?;

    info!("Created configuration at {}", path.display());
    info!("Run 'stakemesh node' to start the node.");
    Ok(())
}

/// Generate a node key
fn run_keygen(args: KeygenArgs) -> Result<(), Box<dyn std::error::Error>> {
    let keypair = Ed25519Keypair::generate()?;
    let public_key = keypair.public_key();
    let address = Address::from_public_key(&public_key, &Blake3Hasher);
    let seed = hex::encode(keypair.seed().as_slice());

    println!("Generated new keypair:");
    println!("  Address:    {}", address);
    println!("  Public Key: {}", public_key.to_hex());
    println!("  Seed:       {}", seed);
    println!();
    println!("Node configuration:");
    println!("  --identity-seed={}", seed);
    println!("  --validator={}", address);

    if let Some(output) = args.output {
        std::fs::write(&output, &seed)?;
        println!("\nSeed saved to: {}", output.display());
    }

    Ok(())
}

/// Show version
fn run_version() {
    println!("StakeMesh {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("  Consensus: stake x reputation weighted proof of stake");
    println!("  Hash:      BLAKE3");
    println!("  Signature: Ed25519");
}
