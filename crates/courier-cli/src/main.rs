//! Courier CLI entry point

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use courier_cli::{cli::Cli, commands::CommandDispatcher, config::CliAppConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = CliAppConfig::load(&cli.overrides()).context("Failed to load configuration")?;
    setup_logging(config.cli.verbose);
    info!("Configuration loaded");

    CommandDispatcher::execute(cli, config)
        .await
        .context("Command execution failed")?;
    Ok(())
}

/// Setup logging based on verbosity level; `RUST_LOG` wins when set
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();
}
