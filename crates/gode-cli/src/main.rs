//! Gode CLI - run scripts against native plugins

mod cli;
mod commands;
mod error;

pub use error::CliError;

use clap::Parser;
use cli::{Cli, Commands};
use gode_kernel::HostConfig;
use std::path::Path;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    // Initialize logging
    let mut logging = config.logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    gode_kernel::logging::try_init(&logging);

    match cli.command {
        Commands::Run { entry, timeout_ms } => commands::run::run(config, &entry, timeout_ms)?,
        Commands::Resolve {
            specifier,
            referrer,
            json,
        } => commands::resolve::run(&config, &specifier, &referrer, json)?,
        Commands::Plugins { libraries } => commands::plugins::run(config, &libraries)?,
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<HostConfig, CliError> {
    match path {
        Some(path) => Ok(HostConfig::load(path)?),
        None => Ok(HostConfig::discover(std::env::current_dir()?)?),
    }
}
