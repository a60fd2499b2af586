use anyhow::{anyhow, Result};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::reload;

pub type LogHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Initialize JSON logging with reloadable level. Without an explicit level
/// `RUST_LOG` is honoured, then `info`.
pub fn init_tracing(log_level: Option<&str>) -> Result<LogHandle> {
    let filter = match log_level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let (filter_layer, handle) = reload::Layer::new(filter);
    let fmt_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init tracing: {e}"))?;
    Ok(handle)
}

/// Swap the active filter for `level`.
pub fn set_log_level(handle: &LogHandle, level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).map_err(|e| anyhow!("invalid log level {level}: {e}"))?;
    handle
        .modify(|f| *f = filter)
        .map_err(|e| anyhow!("failed to reload log level: {e}"))?;
    tracing::info!(level, "log level changed");
    Ok(())
}
