//! Weld command - show the chain for one session tuple

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use weld_core::transport::NullTransport;
use weld_core::{Fitting, Node, PipelineConnector, PolicyId, SessionTuple, Topology};

use super::{load_config, ProtoArg};

/// Weld command arguments
#[derive(Args, Debug)]
pub struct WeldArgs {
    /// Topology file (default: detect)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Transport protocol
    #[arg(long, value_enum, default_value = "tcp")]
    pub proto: ProtoArg,

    /// Client endpoint
    #[arg(long, value_name = "ADDR:PORT")]
    pub client: SocketAddr,

    /// Server endpoint
    #[arg(long, value_name = "ADDR:PORT")]
    pub server: SocketAddr,

    /// Policy rack of the session (unset: no policy)
    #[arg(short, long, value_name = "ID")]
    pub policy: Option<PolicyId>,

    /// Pretend a casing announced this fitting for the server endpoint
    #[arg(long, value_name = "FITTING")]
    pub hint_fitting: Option<Fitting>,

    /// Print the chain as JSON
    #[arg(long)]
    pub json: bool,
}

/// One chain entry as printed
#[derive(Debug, Serialize)]
struct ChainEntry {
    name: String,
    node: String,
    policy: Option<PolicyId>,
    input: Fitting,
    output: Fitting,
    affinity: String,
    strength: i32,
}

impl From<&Arc<PipelineConnector>> for ChainEntry {
    fn from(connector: &Arc<PipelineConnector>) -> Self {
        Self {
            name: connector.name().to_string(),
            node: connector.node().name().to_string(),
            policy: connector.node().policy_id(),
            input: connector.input_fitting(),
            output: connector.output_fitting(),
            affinity: connector.affinity().to_string(),
            strength: connector.affinity_strength(),
        }
    }
}

/// Execute weld command
pub fn execute(args: WeldArgs) -> Result<()> {
    let config = load_config(args.config)?;
    let topology = Topology::build(&config, Arc::new(NullTransport))?;
    let foundry = topology.foundry();

    if let Some(fitting) = args.hint_fitting {
        foundry.add_connection_fitting_hint(args.server, fitting);
    }

    let tuple = SessionTuple::new(args.proto.into(), args.client, args.server);
    let chain: Vec<ChainEntry> = foundry
        .weld(0, &tuple, args.policy)
        .iter()
        .map(ChainEntry::from)
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&chain)?);
        return Ok(());
    }

    let policy = args.policy.map_or_else(|| "none".to_string(), |p| p.to_string());
    println!("{} {} (policy {})", "Session".bold(), tuple, policy);
    if chain.is_empty() {
        println!("  {}", "no connectors: session is not inspected".yellow());
        return Ok(());
    }
    for (i, entry) in chain.iter().enumerate() {
        let scope = entry
            .policy
            .map_or_else(|| "service".to_string(), |p| format!("policy {p}"));
        println!(
            "  {:>2}. {} {} -> {}  [{}, {} {}]",
            i + 1,
            format!("{:<24}", entry.name).green(),
            entry.input,
            entry.output,
            scope,
            entry.affinity,
            entry.strength
        );
    }
    Ok(())
}
