use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use wallet_ledger::config::EngineConfig;
use wallet_ledger::{cli, server};

#[derive(Parser)]
#[command(name = "wallet-ledger")]
#[command(about = "Run wallet transfers against a row-locked ledger")]
enum Cli {
    /// Apply a CSV of open/transfer rows and print final balances
    #[command(name = "cli")]
    CliMode {
        input: PathBuf,
        /// Append a JSON line per committed transfer to this file
        #[arg(long)]
        events: Option<PathBuf>,
        /// TOML engine configuration
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run TCP server
    #[command(name = "server")]
    Server {
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
        #[arg(long, default_value = "1000")]
        max_connections: usize,
        /// TOML engine configuration
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() == 2 && !args[1].starts_with('-') && args[1] != "cli" && args[1] != "server" {
        // Bare file argument, no logging for clean stdout
        cli::run(PathBuf::from(&args[1]), None, EngineConfig::default()).await?;
    } else {
        match Cli::parse() {
            Cli::CliMode {
                input,
                events,
                config,
            } => {
                cli::run(input, events, load_config(config)?).await?;
            }
            Cli::Server {
                bind,
                max_connections,
                config,
            } => {
                // Initialize logging only for server mode
                tracing_subscriber::fmt()
                    .with_writer(std::io::stderr)
                    .with_env_filter(
                        EnvFilter::from_default_env()
                            .add_directive(tracing::Level::INFO.into()),
                    )
                    .init();

                server::run(bind, max_connections, load_config(config)?).await?;
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(&path),
        None => Ok(EngineConfig::default()),
    }
}
