use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Tessera - A BFT consensus node
#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Tessera node and utilities")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a Tessera validator
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,
    },

    /// Write configuration files for a local validator cluster
    Init {
        /// Directory for the generated configs
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Number of validators
        #[arg(short, long, default_value = "4")]
        validators: usize,

        /// Consensus engine (HOTSTUFF, TBFT or SOLO)
        #[arg(long, default_value = "HOTSTUFF")]
        consensus: String,

        /// First RPC port; validator i listens on base_port + i
        #[arg(long, default_value = "8080")]
        base_port: u16,
    },

    /// Generate a new keypair
    Keygen {
        /// Output file for secret key
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show node status
    Status {
        /// RPC endpoint
        #[arg(short, long, default_value = "http://127.0.0.1:8080")]
        endpoint: String,
    },

    /// Submit a transaction
    Tx {
        /// RPC endpoint
        #[arg(short, long, default_value = "http://127.0.0.1:8080")]
        endpoint: String,

        /// Sender secret key hex
        #[arg(long)]
        secret: String,

        /// Transaction nonce
        #[arg(long)]
        nonce: u64,

        /// Transaction fee
        #[arg(long, default_value = "1")]
        fee: u64,

        /// Payload string
        #[arg(long)]
        payload: String,
    },
}
