// src/main.rs
// uvd: universal validator daemon CLI.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use uv_node::config::Config;
use uv_node::foreign::ForeignChainRegistry;
use uv_node::keyring::{Keyring, KeyringBackend};
use uv_node::transport::Identity;
use uv_node::tss::loopback::LoopbackEngine;

#[derive(Parser)]
#[command(name = "uvd")]
#[command(about = "Universal validator daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Node home directory (default: ~/.uv-node)
    #[arg(long, global = true)]
    home: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon
    Start,
    /// Generate the hot key and the p2p identity
    Keygen {
        /// Name for the hot key in the keyring
        #[arg(long, default_value = "hotkey")]
        name: String,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default config file under the node home
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = Config::load(cli.home.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Start => {
            prompt_keyring_password_if_needed(&mut cfg)?;
            // No production threshold-signing engine is linked into this
            // build; the loopback engine drives the full session plumbing
            // but is not a real threshold scheme.
            tracing::warn!("starting with the loopback protocol engine");
            let engine = Arc::new(LoopbackEngine::new());
            let foreign = ForeignChainRegistry::new();
            uv_node::run_daemon(cfg, engine, foreign).await
        }
        Commands::Keygen { name } => keygen(&mut cfg, &name),
        Commands::Config { command: ConfigCommands::Init } => {
            let path = cfg.save().context("writing config file")?;
            println!("Wrote {}", path.display());
            Ok(())
        }
    }
}

/// For the `file` backend, take the password from the environment or prompt
/// for it on the terminal.
fn prompt_keyring_password_if_needed(cfg: &mut Config) -> Result<()> {
    if cfg.keyring_backend != KeyringBackend::File || cfg.keyring_password.is_some() {
        return Ok(());
    }
    let password = rpassword::prompt_password("Keyring password: ")
        .context("reading keyring password")?;
    if password.is_empty() {
        bail!("keyring password must not be empty");
    }
    cfg.keyring_password = Some(password);
    Ok(())
}

fn keygen(cfg: &mut Config, name: &str) -> Result<()> {
    prompt_keyring_password_if_needed(cfg)?;

    let keyring = Keyring::open(
        &cfg.node_home,
        cfg.keyring_backend,
        cfg.keyring_password.clone(),
    )?;
    let hot_key = keyring.create_key(name)?;
    println!("Hot key created");
    println!("  name:    {}", hot_key.name);
    println!("  address: {}", hot_key.address);

    let identity = Identity::generate();
    println!("P2P identity generated");
    println!("  peer id: {}", identity.peer_id());
    println!();
    println!("Add the seed to your environment (never commit it):");
    println!("  UV_P2P_PRIVATE_KEY_HEX={}", identity.seed_hex());
    println!();
    println!("Then ask the granter to authorize {} for voting.", hot_key.address);
    Ok(())
}
