use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use tessera_consensus::EngineRegistry;
use tessera_core::{KeyPair, SecretKey, Transaction};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod cli;
mod config;
mod node;

use cli::{Cli, Commands};
use config::{generate_cluster_configs, NodeConfig};
use node::Node;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            run_node(&config).await?;
        }
        Commands::Init {
            output,
            validators,
            consensus,
            base_port,
        } => {
            init_configs(&output, validators, &consensus, base_port)?;
        }
        Commands::Keygen { output } => {
            generate_keypair(output)?;
        }
        Commands::Status { endpoint } => {
            show_status(&endpoint).await?;
        }
        Commands::Tx {
            endpoint,
            secret,
            nonce,
            fee,
            payload,
        } => {
            submit_transaction(&endpoint, &secret, nonce, fee, payload).await?;
        }
    }

    Ok(())
}

async fn run_node(config_path: &Path) -> Result<()> {
    info!("Loading configuration from {:?}", config_path);

    if !config_path.exists() {
        error!(
            "Configuration file not found: {:?}. Run 'tessera init' to create one.",
            config_path
        );
        return Err(anyhow::anyhow!("Configuration file not found"));
    }
    let config = NodeConfig::load(config_path)?;

    let node = Node::new(config, EngineRegistry::with_defaults())?;
    node.run().await
}

/// Write one config per validator of a fresh local cluster
fn init_configs(output: &Path, validators: usize, consensus: &str, base_port: u16) -> Result<()> {
    let registry = EngineRegistry::with_defaults();
    if !registry.contains(consensus) {
        return Err(anyhow::anyhow!(
            "unknown consensus engine {:?} (available: {})",
            consensus,
            registry.names().join(", ")
        ));
    }

    std::fs::create_dir_all(output)?;
    let configs = generate_cluster_configs(validators, consensus, base_port)?;
    let mut paths: Vec<PathBuf> = Vec::new();
    for (i, config) in configs.iter().enumerate() {
        let path = output.join(format!("node{}.json", i));
        config.save(&path)?;
        paths.push(path);
    }

    info!("Wrote {} validator configs to {:?}", paths.len(), output);

    println!("\nConfiguration files created:");
    for path in &paths {
        println!("  {}", path.display());
    }
    println!("\nStart each validator with:");
    println!("  tessera run --config <file>");

    Ok(())
}

fn generate_keypair(output: Option<PathBuf>) -> Result<()> {
    let keypair = KeyPair::generate();

    println!("Generated new keypair:");
    println!("  Public key:  {}", keypair.public.to_hex());
    println!("  Secret key:  {}", keypair.secret.to_hex());

    if let Some(path) = output {
        std::fs::write(&path, keypair.secret.to_hex())?;
        info!("Secret key saved to {:?}", path);
    }

    println!("\nWARNING: Keep your secret key safe! Do not share it with anyone.");

    Ok(())
}

async fn show_status(endpoint: &str) -> Result<()> {
    let url = format!("{}/status", endpoint.trim_end_matches('/'));

    let response = reqwest::get(&url).await?;

    if response.status().is_success() {
        let status: serde_json::Value = response.json().await?;
        println!("Node Status:");
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        error!("Failed to get status: {}", response.status());
    }

    Ok(())
}

/// Sign a transaction locally and submit it
async fn submit_transaction(endpoint: &str, secret: &str, nonce: u64, fee: u64, payload: String) -> Result<()> {
    let secret = SecretKey::from_hex(secret)?;
    let sender = secret.public_key();
    let tx = Transaction::new_signed(sender, nonce, fee, payload.into_bytes(), &secret)?;

    let url = format!("{}/tx", endpoint.trim_end_matches('/'));
    let client = reqwest::Client::new();
    let response = client
        .post(&url)
        .json(&tessera_rpc::TxSubmitRequest { transaction: tx })
        .send()
        .await?;

    let success = response.status().is_success();
    let body: serde_json::Value = response.json().await?;
    if success {
        println!("Transaction submitted:");
    } else {
        error!("Failed to submit transaction:");
    }
    println!("{}", serde_json::to_string_pretty(&body)?);

    Ok(())
}
