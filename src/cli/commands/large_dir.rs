//! Large-messages directory listing.

use crate::cli::args::LargeDirArgs;
use crate::server::large_store;
use anyhow::{Context, Result};
use serde_json::json;

pub fn run_large_dir(args: LargeDirArgs) -> Result<()> {
    let files = large_store::inspect(&args.path).with_context(|| {
        format!(
            "unable to read large message directory {}",
            args.path.display()
        )
    })?;
    if args.json {
        let entries: Vec<_> = files
            .iter()
            .map(|f| json!({ "message_id": f.message_id, "path": f.path, "size": f.size }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if files.is_empty() {
        println!("no large message files found");
        return Ok(());
    }
    println!("{:<20} {:<14} {}", "message_id", "bytes", "path");
    for file in &files {
        println!("{:<20} {:<14} {}", file.message_id, file.size, file.path.display());
    }
    let total: u64 = files.iter().map(|f| f.size).sum();
    println!("{} files, {} bytes", files.len(), total);
    Ok(())
}
