//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// hornetq - address settings and large-message tooling.
#[derive(Parser)]
#[command(name = "hornetq")]
#[command(version)]
#[command(about = "hornetq broker core diagnostic tools")]
pub struct Cli {
    /// Log level filter (overrides telemetry.log_level)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Resolve the merged address settings for an address
    Resolve(ResolveArgs),

    /// Validate a configuration file
    Check(CheckArgs),

    /// List large message files in a directory
    LargeDir(LargeDirArgs),
}

// -----------------------------------------------------------------------------
// Resolve command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct ResolveArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/hornetq.toml")]
    pub config: PathBuf,

    /// Address to resolve
    pub address: String,

    /// Print the matching patterns, most specific first
    #[arg(long)]
    pub explain: bool,
}

// -----------------------------------------------------------------------------
// Check command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct CheckArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/hornetq.toml")]
    pub config: PathBuf,
}

// -----------------------------------------------------------------------------
// Large-dir command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct LargeDirArgs {
    /// Large-messages directory
    pub path: PathBuf,

    /// Emit JSON instead of a table
    #[arg(long)]
    pub json: bool,
}
