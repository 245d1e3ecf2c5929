//! Config command - topology file management

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use weld_core::transport::NullTransport;
use weld_core::{Config, Topology};

/// File names searched in the working directory, in order
const LOCAL_CANDIDATES: [&str; 2] = ["weld.toml", "topology.toml"];

/// Config command arguments
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective topology
    Show {
        /// Topology file to show (default: detect, then the sample)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Generate a sample topology file
    Generate {
        /// Output file path
        #[arg(short, long, default_value = "weld.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a topology file and build it
    Validate {
        /// Topology file to validate
        file: PathBuf,
    },

    /// Show topology file locations
    Paths,
}

/// Execute config command
pub fn execute(args: ConfigArgs) -> Result<()> {
    match args.action {
        ConfigAction::Show { file } => show_config(file),
        ConfigAction::Generate { output, force } => generate_config(output, force),
        ConfigAction::Validate { file } => validate_config(file),
        ConfigAction::Paths => show_paths(),
    }
}

fn show_config(file: Option<PathBuf>) -> Result<()> {
    let config = match file.or_else(find_config_file) {
        Some(path) => {
            Config::load(&path).with_context(|| format!("Failed to load config from {}", path.display()))?
        }
        None => Config::sample(),
    };

    let toml_str = config.to_toml().context("Failed to serialize config")?;
    println!("{toml_str}");
    Ok(())
}

fn generate_config(output: PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", output.display());
    }

    let toml_str = Config::sample()
        .to_toml()
        .context("Failed to serialize config")?;

    let content = format!(
        "# Pipeline weld topology\n\
         # Sample: a firewall on policy 1, a web filter on policy 2,\n\
         # an HTTP casing and a service-wide virus blocker\n\n\
         {toml_str}"
    );

    std::fs::write(&output, content)
        .with_context(|| format!("Failed to write config to {}", output.display()))?;

    info!(path = %output.display(), "Generated config file");
    println!("Configuration file generated: {}", output.display());
    Ok(())
}

fn validate_config(file: PathBuf) -> Result<()> {
    let config =
        Config::load(&file).with_context(|| format!("Failed to load config from {}", file.display()))?;

    config.validate().context("Configuration validation failed")?;

    let topology =
        Topology::build(&config, Arc::new(NullTransport)).context("Failed to build topology")?;
    let registered = topology.foundry().connectors().len();

    println!("{}", "✓ Configuration is valid".green());
    println!("  Name: {}", config.general.name);
    println!("  Policies: {}", config.policies.len());
    println!("  Nodes: {}", topology.nodes().len());
    println!(
        "  Connectors: {} built, {} registered",
        topology.connectors().len(),
        registered
    );
    println!("  Casings: {}", config.casings.len());
    Ok(())
}

fn show_paths() -> Result<()> {
    println!("Topology file search paths:");
    println!();

    for (i, name) in LOCAL_CANDIDATES.iter().enumerate() {
        println!("  {}. ./{}", i + 1, name);
    }

    if let Some(dirs) = directories::ProjectDirs::from("", "", "weld") {
        println!(
            "  {}. {}",
            LOCAL_CANDIDATES.len() + 1,
            dirs.config_dir().join("weld.toml").display()
        );
    }

    Ok(())
}

/// First existing topology file among the search paths
pub fn find_config_file() -> Option<PathBuf> {
    for name in LOCAL_CANDIDATES {
        let path = PathBuf::from(name);
        if path.exists() {
            return Some(path);
        }
    }

    let dirs = directories::ProjectDirs::from("", "", "weld")?;
    let path = dirs.config_dir().join("weld.toml");
    path.exists().then_some(path)
}
