//! hornetq - unified CLI entrypoint.
//!
//! Usage:
//!   hornetq resolve --config config/hornetq.toml orders.eu
//!   hornetq check --config config/hornetq.toml
//!   hornetq large-dir data/large-messages

use anyhow::Result;
use clap::Parser;
use hornetq_core::cli::commands::{run_check, run_large_dir, run_resolve};
use hornetq_core::cli::{Cli, Commands};
use hornetq_core::ops::telemetry::init_tracing;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(Some(cli.log_level.as_deref().unwrap_or("warn")))?;

    match cli.command {
        Commands::Resolve(args) => run_resolve(args),
        Commands::Check(args) => run_check(args),
        Commands::LargeDir(args) => run_large_dir(args),
    }
}
