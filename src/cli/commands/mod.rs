//! CLI command implementations.

mod check;
mod large_dir;
mod resolve;

pub use check::run_check;
pub use large_dir::run_large_dir;
pub use resolve::run_resolve;
