pub mod handlers;
pub mod setup;

use clap::{Arg, ArgAction, Command};

pub fn build_cli() -> Command {
    Command::new("lockstep")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Run lock-guarded pipelines against a shared resource pool")
        .subcommand_required(true)
        .subcommand(cmd_run())
        .subcommand(cmd_check())
}

fn config_arg() -> Arg {
    Arg::new("config")
        .required(true)
        .value_name("CONFIG")
        .help("Path to the pipelines TOML file")
}

fn cmd_run() -> Command {
    Command::new("run")
        .about("Run every pipeline, each inside its lock step")
        .arg(config_arg())
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Print the pipeline reports as JSON"),
        )
}

fn cmd_check() -> Command {
    Command::new("check")
        .about("Validate the config and print each pipeline's lock")
        .arg(config_arg())
}
