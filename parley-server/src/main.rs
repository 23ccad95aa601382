#![cfg_attr(not(test), forbid(unsafe_code))]

//! Command line entry point for the Parley server.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use parley_server::server;
use shared::config::server::Config;


/// Main CLI structure for the Parley server.
#[derive(Debug, Parser)]
#[command(name = "parley-server")]
#[command(about = "WebSocket chat hub and conversation store", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands for the Parley CLI.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the server
    Serve {
        /// Port to bind, overriding the file and `PARLEY_SERVER_PORT`.
        #[arg(long, short)]
        port: Option<u16>,

        /// Path to a YAML or JSON configuration file.
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Resolve the configuration, print a summary and exit.
    CheckConfig {
        /// Path to a YAML or JSON configuration file.
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

/// Loads `.env` and parses the command line.
#[must_use]
pub fn initialize_cli() -> Cli {
    dotenv().ok();
    Cli::parse()
}

/// Dispatch a parsed command.
///
/// # Errors
/// Returns an error if configuration loading or the server fails.
pub async fn run_app(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve { port, config } => {
            let config = Config::load_config(config, port)?;
            server::run(config).await
        }
        Commands::CheckConfig { config } => {
            let config = Config::load_config(config, None)?;
            println!("configuration ok: {config}");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run_app(initialize_cli()).await
}
