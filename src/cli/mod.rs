//! hornetq CLI - configuration and storage diagnostics.
//!
//! Provides a single binary entry point for:
//! - `hornetq resolve` - Show the effective address settings for an address
//! - `hornetq check` - Load and validate a configuration file
//! - `hornetq large-dir` - List files in a large-messages directory

mod args;
pub mod commands;

pub use args::{CheckArgs, Cli, Commands, LargeDirArgs, ResolveArgs};
