use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Stablecoin payment rail: escrowed principal accrues strategy yield,
/// released payments split it between user, merchant, and protocol.
#[derive(Parser)]
#[command(name = "yield-rails", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the engine daemon and its API server
    Run {
        /// Path to a JSON config file (defaults apply when omitted)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Path to the ledger database
        #[arg(long, default_value = "data/yield-rails.db")]
        db: PathBuf,

        /// API listen address
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: String,

        /// Use in-process mock collaborators instead of configured endpoints
        #[arg(long)]
        mock: bool,
    },

    /// Drive sample payments through their lifecycle on mock collaborators
    Demo,

    /// Dump a payment's ledger events
    Ledger {
        /// Payment id to inspect
        payment_id: String,

        /// Path to the ledger database
        #[arg(long, default_value = "data/yield-rails.db")]
        db: PathBuf,
    },

    /// Print a default configuration file to stdout
    ExampleConfig,

    /// Print the JSON schema of the command payloads
    Schema,
}
