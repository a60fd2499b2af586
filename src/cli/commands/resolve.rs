//! Effective address settings for one address.

use crate::cli::args::ResolveArgs;
use crate::core::config::Config;
use crate::settings::wildcard::Pattern;
use anyhow::Result;

pub fn run_resolve(args: ResolveArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    config.validate()?;
    let repository = config.build_settings_repository()?;
    if args.explain {
        let mut matching: Vec<Pattern> = config
            .address_settings
            .iter()
            .filter_map(|entry| Pattern::parse(&entry.pattern).ok())
            .filter(|pattern| pattern.matches(&args.address))
            .collect();
        matching.sort_by(|a, b| b.compare_specificity(a));
        if matching.is_empty() {
            eprintln!("no pattern matches '{}', broker defaults apply", args.address);
        }
        for pattern in &matching {
            eprintln!("match: {}", pattern.as_str());
        }
    }
    let settings = repository.get_match(&args.address);
    println!("{}", serde_json::to_string_pretty(&*settings)?);
    Ok(())
}
