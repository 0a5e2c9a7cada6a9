//! Stratum - operator CLI entrypoint.
//!
//! Usage:
//!   stratum config validate --config config/stratum.toml
//!   stratum config show --config config/stratum.toml --format json
//!   stratum diagnose [--ha] --config config/stratum.toml
//!   stratum list [prefix] [--recursive] --config config/stratum.toml

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use stratum::cli::commands::{run_config, run_diagnose, run_list};
use stratum::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/stratum.toml"));
    let log_level = cli.log_level.as_deref();

    match cli.command {
        Commands::Config(args) => run_config(args),
        Commands::Diagnose(args) => run_diagnose(&config_path, log_level, args).await,
        Commands::List(args) => run_list(&config_path, log_level, args).await,
    }
}
