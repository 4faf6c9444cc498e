//! Cask CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cask_cli::commands::{dispatch, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.global.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if let Err(e) = dispatch(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(e.exit_code());
    }
}
