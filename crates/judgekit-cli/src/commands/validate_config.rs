//! The `judgekit validate-config` command.

use std::path::PathBuf;

use anyhow::{Context, Result};

use judgekit_providers::config::load_config_from;

pub fn execute(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config_from(config_path.as_deref())?;

    println!("Providers ({}):", config.providers.len());
    for (name, provider) in &config.providers {
        println!("  {name}: {provider:?}");
    }
    println!("Raters ({}):", config.raters.len());
    for rater in &config.raters {
        println!(
            "  {} -> {} / {} ({:?})",
            rater.id, rater.provider, rater.model, rater.mode
        );
    }

    config
        .validate_preconditions()
        .context("configuration is not usable")?;

    println!("Configuration valid.");
    Ok(())
}
