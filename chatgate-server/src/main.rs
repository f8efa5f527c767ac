#![cfg_attr(not(test), forbid(unsafe_code))]
#![deny(warnings, clippy::pedantic)]

//! Main entry point for the `ChatGate` gateway.

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use server::server::run;
use shared::config::server::Config;
use std::error::Error;
use std::path::PathBuf;

/// Main CLI structure for the `ChatGate` server
#[derive(Parser, Debug)]
#[command(name = "chatgate")]
#[command(about = "Multi-tenant chat gateway", long_about = None)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands for the `ChatGate` CLI
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the gateway
    Serve {
        /// Port override
        #[arg(
            long,
            short,
            help = "Port to bind, overriding the configuration file and CHATGATE_SERVER_PORT."
        )]
        port: Option<u16>,

        /// Configuration file path
        #[arg(
            long,
            short,
            help = "Path to the configuration file (yaml, json or toml). Defaults are used when omitted."
        )]
        config: Option<PathBuf>,
    },
}

/// Loads configuration and runs the gateway until shutdown.
///
/// # Errors
/// Returns an error if configuration loading or server startup fails.
pub async fn handle_serve_command(
    port: Option<u16>,
    config: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let resolved_config = Config::load_config(config, port)?;
    run(resolved_config).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, config } => handle_serve_command(port, config).await,
    }
}
