//! Check command implementation
//!
//! Validates a config without running anything.

use std::path::Path;

use anyhow::Result;

use crate::config::Config;

/// One line per pipeline: its name and lock description.
#[must_use]
pub fn describe(config: &Config) -> Vec<String> {
    config
        .pipelines
        .iter()
        .map(|p| {
            let variable = p
                .lock
                .variable_name()
                .map(|v| format!(" as ${v}"))
                .unwrap_or_default();
            format!("{}: lock [{}]{variable}", p.name, p.lock)
        })
        .collect()
}

/// Run the check command
///
/// # Errors
///
/// Returns an error if the config cannot be loaded or is invalid
pub fn execute(path: &Path) -> Result<()> {
    let config = Config::load(path)?;
    for line in describe(&config) {
        println!("{line}");
    }
    println!(
        "✓ {} pipeline(s), {} resource(s)",
        config.pipelines.len(),
        config.resources.len()
    );
    Ok(())
}
