//! weldctl
//!
//! Command-line interface for the pipeline weld engine.

mod args;
mod commands;
mod logging;

use anyhow::Result;
use clap::Parser;
use tracing::error;

use args::Args;
use commands::Command;

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging; the guard flushes the log file on exit
    let defaults = commands::logging_defaults(&args.command);
    let _guard = logging::init(&args, &defaults)?;

    let result = run(args);

    if let Err(ref e) = result {
        error!("Fatal error: {:#}", e);
    }

    result
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Weld(weld_args) => commands::weld::execute(weld_args),
        Command::Simulate(sim_args) => {
            if !args.quiet {
                print_banner();
            }
            commands::simulate::execute(sim_args)
        }
        Command::Config(config_args) => commands::config::execute(config_args),
        Command::Completions(comp_args) => commands::completions::execute(comp_args),
    }
}

fn print_banner() {
    use colored::Colorize;

    let title = format!("weldctl v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("{}", "╔═══════════════════════════════════════════╗".cyan());
    let subtitle = "Session churn simulation";
    println!("{}{}{}", "║  ".cyan(), format!("{title:<41}").green().bold(), "║".cyan());
    println!("{}{}{}", "║  ".cyan(), format!("{subtitle:<41}").white(), "║".cyan());
    println!("{}", "╚═══════════════════════════════════════════╝".cyan());
    println!();
}
