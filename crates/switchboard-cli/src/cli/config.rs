//! `swbd config` subcommands.

use std::path::Path;

use anyhow::Result;
use console::style;
use switchboard_types::config::SwitchboardConfig;

/// Print the effective configuration (file merged over defaults).
pub fn show(config: &SwitchboardConfig, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

pub fn path(path: &Path, json: bool) -> Result<()> {
    let exists = path.exists();
    if json {
        let out = serde_json::json!({
            "path": path.display().to_string(),
            "exists": exists,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let marker = if exists {
        style("exists").green()
    } else {
        style("not found, using defaults").yellow()
    };
    println!("{} ({marker})", path.display());
    Ok(())
}
