//! Command-line interface.
//!
//! Operator CLI for validating configuration and probing storage.

pub mod commands;

use clap::{Parser, Subcommand};

/// Stratum - physical storage layer tooling.
#[derive(Parser, Debug)]
#[command(name = "stratum")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Configuration operations.
    Config(commands::ConfigArgs),
    /// Round-trip a probe key through the configured storage.
    Diagnose(commands::DiagnoseArgs),
    /// List keys under a prefix.
    List(commands::ListArgs),
}
