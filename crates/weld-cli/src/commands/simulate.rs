//! Simulate command - concurrent session churn through the engine

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Args;
use colored::Colorize;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use weld_core::dispatch::NodeMetric;
use weld_core::session::{Outbound, OutboundOp, SessionId};
use weld_core::tuple::Protocol;
use weld_core::{
    Engine, NewSessionOutcome, Node, PolicyId, SessionEvent, SessionRequest, SessionTuple, Side,
    Topology, Transport,
};

use super::load_config;

/// Server ports picked for simulated sessions
const TCP_PORTS: [u16; 6] = [21, 25, 80, 443, 8080, 22];
const UDP_PORTS: [u16; 2] = [53, 123];

const DEFAULT_PAYLOAD: &[u8] = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";

/// Simulate command arguments
#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Topology file (default: detect)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Number of sessions to run
    #[arg(short = 'n', long, default_value_t = 1000)]
    pub sessions: u64,

    /// Worker threads
    #[arg(short, long, default_value_t = 4)]
    pub threads: usize,

    /// Policy rack of every session (default: random policy from the topology)
    #[arg(short, long, value_name = "ID")]
    pub policy: Option<PolicyId>,

    /// Payload each side sends, hex encoded
    #[arg(long, value_name = "HEX")]
    pub payload_hex: Option<String>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Transport counting what leaves the chains
#[derive(Debug, Default)]
struct CountingTransport {
    data_ops: AtomicU64,
    data_bytes: AtomicU64,
    control_ops: AtomicU64,
    releases: AtomicU64,
}

impl Transport for CountingTransport {
    fn emit(&self, _session_id: SessionId, outbound: Outbound) {
        match outbound.op {
            OutboundOp::Data(data) => {
                self.data_ops.fetch_add(1, Ordering::Relaxed);
                self.data_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
            }
            _ => {
                self.control_ops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn release_session(&self, _session_id: SessionId, _node: &str) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }
}

/// Outcome counters across workers
#[derive(Debug, Default)]
struct Outcomes {
    accepted: AtomicU64,
    released: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Serialize)]
struct ConnectorReport {
    connector: String,
    policy: Option<PolicyId>,
    metrics: Vec<NodeMetric>,
}

#[derive(Debug, Serialize)]
struct Report {
    sessions: u64,
    threads: usize,
    elapsed_ms: u128,
    sessions_per_sec: f64,
    accepted: u64,
    released: u64,
    rejected: u64,
    failed: u64,
    emitted_data: u64,
    emitted_bytes: u64,
    emitted_control: u64,
    stage_releases: u64,
    connectors: Vec<ConnectorReport>,
}

/// Execute simulate command
pub fn execute(args: SimulateArgs) -> Result<()> {
    if args.threads == 0 {
        bail!("--threads must be at least 1");
    }
    let payload = match args.payload_hex {
        Some(ref hex_str) => Bytes::from(hex::decode(hex_str.trim()).context("Invalid --payload-hex")?),
        None => Bytes::from_static(DEFAULT_PAYLOAD),
    };

    let config = load_config(args.config.clone())?;
    let transport = Arc::new(CountingTransport::default());
    let topology = Topology::build(&config, transport.clone())?;
    let engine = topology.engine();

    let policies: Vec<Option<PolicyId>> = match args.policy {
        Some(policy) => vec![Some(policy)],
        None if config.policies.is_empty() => vec![None],
        None => config.policies.iter().map(|p| Some(p.id)).collect(),
    };

    info!(
        sessions = args.sessions,
        threads = args.threads,
        connectors = topology.foundry().connectors().len(),
        "Starting simulation"
    );

    let outcomes = Outcomes::default();
    let started = Instant::now();
    let threads = args.threads as u64;

    std::thread::scope(|scope| {
        for worker in 0..threads {
            let (engine, outcomes, policies, payload) = (&engine, &outcomes, &policies, &payload);
            std::thread::Builder::new()
                .name(format!("sim-{worker}"))
                .spawn_scoped(scope, move || {
                    let mut rng = rand::thread_rng();
                    let mut id = worker;
                    while id < args.sessions {
                        let policy = policies.choose(&mut rng).copied().flatten();
                        run_session(engine, outcomes, &mut rng, id, policy, payload);
                        id += threads;
                    }
                })
                .context("Failed to spawn worker")?;
        }
        Ok::<(), anyhow::Error>(())
    })?;

    engine.tick();
    engine.shutdown();
    let elapsed = started.elapsed();

    let report = report(&args, &topology, &outcomes, &transport, elapsed);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn run_session(
    engine: &Engine,
    outcomes: &Outcomes,
    rng: &mut impl Rng,
    id: SessionId,
    policy: Option<PolicyId>,
    payload: &Bytes,
) {
    let protocol = if rng.gen_ratio(1, 8) {
        Protocol::Udp
    } else {
        Protocol::Tcp
    };
    let server_port = match protocol {
        Protocol::Tcp => *TCP_PORTS.choose(rng).unwrap_or(&80),
        Protocol::Udp => *UDP_PORTS.choose(rng).unwrap_or(&53),
    };
    let client = SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, rng.gen_range(2..=254))),
        rng.gen_range(1024..=65535),
    );
    let server = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)), server_port);
    let request = SessionRequest::new(id, SessionTuple::new(protocol, client, server), policy);

    match engine.new_session_request(request) {
        NewSessionOutcome::Accepted { .. } => {
            outcomes.accepted.fetch_add(1, Ordering::Relaxed);
        }
        NewSessionOutcome::Released => {
            outcomes.released.fetch_add(1, Ordering::Relaxed);
            return;
        }
        NewSessionOutcome::Rejected { .. } => {
            outcomes.rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }
    }

    let mut events = vec![
        SessionEvent::Chunk {
            side: Side::Client,
            data: payload.clone(),
        },
        SessionEvent::Chunk {
            side: Side::Server,
            data: payload.clone(),
        },
    ];
    match protocol {
        Protocol::Tcp => {
            events.push(SessionEvent::Fin(Side::Client));
            events.push(SessionEvent::Fin(Side::Server));
            events.push(SessionEvent::Complete);
        }
        Protocol::Udp => events.push(SessionEvent::Expired(Side::Client)),
    }

    for event in events {
        if let Err(e) = engine.dispatch(id, event) {
            debug!(session_id = id, error = %e, "Session killed");
            outcomes.failed.fetch_add(1, Ordering::Relaxed);
            return;
        }
    }
    if let Err(e) = engine.raze(id) {
        debug!(session_id = id, error = %e, "Raze failed");
    }
}

fn report(
    args: &SimulateArgs,
    topology: &Topology,
    outcomes: &Outcomes,
    transport: &CountingTransport,
    elapsed: Duration,
) -> Report {
    let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
    let secs = elapsed.as_secs_f64();
    #[allow(clippy::cast_precision_loss)]
    let sessions_per_sec = if secs > 0.0 { args.sessions as f64 / secs } else { 0.0 };

    let connectors = topology
        .connectors()
        .iter()
        .map(|c| ConnectorReport {
            connector: c.name().to_string(),
            policy: c.node().policy_id(),
            metrics: c.dispatcher().metrics(),
        })
        .collect();

    Report {
        sessions: args.sessions,
        threads: args.threads,
        elapsed_ms: elapsed.as_millis(),
        sessions_per_sec,
        accepted: load(&outcomes.accepted),
        released: load(&outcomes.released),
        rejected: load(&outcomes.rejected),
        failed: load(&outcomes.failed),
        emitted_data: load(&transport.data_ops),
        emitted_bytes: load(&transport.data_bytes),
        emitted_control: load(&transport.control_ops),
        stage_releases: load(&transport.releases),
        connectors,
    }
}

fn print_report(report: &Report) {
    println!("{}", "Simulation complete".green().bold());
    println!(
        "  Sessions: {} on {} threads in {} ms ({:.0}/s)",
        report.sessions, report.threads, report.elapsed_ms, report.sessions_per_sec
    );
    println!(
        "  Accepted: {}  Released: {}  Rejected: {}  Killed: {}",
        report.accepted, report.released, report.rejected, report.failed
    );
    println!(
        "  Transport: {} data ops ({} bytes), {} control ops, {} stage releases",
        report.emitted_data, report.emitted_bytes, report.emitted_control, report.stage_releases
    );
    println!();
    println!("{}", "Connector metrics".bold());
    for connector in &report.connectors {
        let scope = connector
            .policy
            .map_or_else(|| "service".to_string(), |p| format!("policy {p}"));
        println!("  {} ({})", connector.connector.cyan(), scope);
        for metric in &connector.metrics {
            println!("    {:<24} {}", metric.display_name, metric.value);
        }
    }
}
