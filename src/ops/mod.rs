//! Operations.
//!
//! - `telemetry` - Structured JSON logging with a reloadable level filter

pub mod telemetry;

pub use telemetry::*;
