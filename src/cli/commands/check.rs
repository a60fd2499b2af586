//! Configuration validation.

use crate::cli::args::CheckArgs;
use crate::core::config::Config;
use anyhow::Result;

pub fn run_check(args: CheckArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    config.validate()?;
    let repository = config.build_settings_repository()?;
    config.build_security()?;
    println!("config: {}", args.config.display());
    println!("address settings patterns: {}", repository.len());
    println!("security role patterns: {}", config.security.roles.len());
    println!("security users: {}", config.security.users.len());
    println!(
        "large messages: {} (> {} bytes, {} byte chunks, compression {})",
        config.broker.large_messages_dir.display(),
        config.client.min_large_message_size,
        config.client.large_message_chunk_size,
        if config.client.compress_large_message { "on" } else { "off" }
    );
    println!("ok");
    Ok(())
}
