//! Per-address policy resolution.
//!
//! - `wildcard` - Address pattern parsing, matching and specificity
//! - `address_settings` - The address policy record and its defaults
//! - `repository` - Pattern-keyed store merging overlapping matches

pub mod address_settings;
pub mod repository;
pub mod wildcard;

pub use address_settings::*;
pub use repository::*;
pub use wildcard::Pattern;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("illegal match pattern '{pattern}': {reason}")]
    IllegalPattern { pattern: String, reason: String },
    /// Reserved for a strict merge mode; never raised by the default merge.
    #[error("pattern '{pattern}' conflicts on field '{field}'")]
    ConflictingField { pattern: String, field: String },
}
