//! Core infrastructure.
//!
//! - `config` - Configuration parsing, validation and runtime object construction

pub mod config;

pub use config::*;
