use std::path::Path;

use anyhow::{Context, Result};
use clap::ArgMatches;

use crate::commands::{check, run};

pub async fn dispatch(matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("run", sub_m)) => handle_run(sub_m).await,
        Some(("check", sub_m)) => handle_check(sub_m),
        _ => anyhow::bail!("Unknown command. Run 'lockstep --help' for usage."),
    }
}

fn config_path(matches: &ArgMatches) -> Result<&Path> {
    matches
        .get_one::<String>("config")
        .map(Path::new)
        .context("Config path required")
}

async fn handle_run(matches: &ArgMatches) -> Result<()> {
    run::execute(config_path(matches)?, matches.get_flag("json")).await
}

fn handle_check(matches: &ArgMatches) -> Result<()> {
    check::execute(config_path(matches)?)
}
