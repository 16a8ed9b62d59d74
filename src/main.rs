use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kadnode::{Config, Dht};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let dht = match Dht::start(config) {
        Ok(dht) => dht,
        Err(error) => {
            error!(%error, "Failed to start node");
            return ExitCode::FAILURE;
        }
    };

    info!(
        id = %dht.id(),
        api = %dht.api_address(),
        p2p = %dht.p2p_address(),
        "Node running, press Ctrl-C to stop"
    );

    let shutdown = dht.shutdown_handle();
    if let Err(error) = ctrlc::set_handler(move || shutdown.shutdown()) {
        error!(%error, "Failed to install Ctrl-C handler");
    }

    dht.block_until_shutdown();

    ExitCode::SUCCESS
}
