//! CLI commands

pub mod completions;
pub mod config;
pub mod simulate;
pub mod weld;

pub use config::ConfigAction;

use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use std::path::PathBuf;
use weld_core::tuple::Protocol;
use weld_core::config::LoggingConfig;
use weld_core::Config;

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the connector chain a session would be welded into
    Weld(weld::WeldArgs),

    /// Drive concurrent simulated sessions through the engine
    Simulate(simulate::SimulateArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Generate shell completions
    Completions(completions::CompletionsArgs),
}

/// Transport protocol argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProtoArg {
    /// TCP stream
    Tcp,
    /// UDP flow
    Udp,
}

impl From<ProtoArg> for Protocol {
    fn from(proto: ProtoArg) -> Self {
        match proto {
            ProtoArg::Tcp => Protocol::Tcp,
            ProtoArg::Udp => Protocol::Udp,
        }
    }
}

/// Load the topology from `path`, or from the first config file found
pub fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let path = match path {
        Some(path) => path,
        None => config::find_config_file()
            .context("No topology file given and none found (see `weldctl config paths`)")?,
    };
    let config =
        Config::load(&path).with_context(|| format!("Failed to load config from {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

/// `[logging]` section of the topology a command will read
///
/// Load errors are left to the command itself; logging then falls back to
/// the built-in defaults.
pub fn logging_defaults(command: &Command) -> LoggingConfig {
    let path = match command {
        Command::Weld(args) => args.config.clone(),
        Command::Simulate(args) => args.config.clone(),
        Command::Config(args) => match args.action {
            ConfigAction::Show { ref file } => file.clone(),
            ConfigAction::Validate { ref file } => Some(file.clone()),
            ConfigAction::Generate { .. } | ConfigAction::Paths => return LoggingConfig::default(),
        },
        Command::Completions(_) => return LoggingConfig::default(),
    };

    path.or_else(config::find_config_file)
        .and_then(|path| Config::load(path).ok())
        .map(|config| config.logging)
        .unwrap_or_default()
}
