//! Configuration management
//!
//! A TOML file carries both tuning (foundry, dispatcher, logging) and the
//! topology to load: policy tree, node instances and their connectors.

mod topology;

pub use topology::Topology;

use crate::connector::{Affinity, Subscription};
use crate::error::{Error, Result};
use crate::fitting::Fitting;
use crate::node::NodeState;
use crate::policy::PolicyId;
use crate::tuple::{ports, Protocol, ProtocolMask};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Weld settings
    pub foundry: FoundryConfig,

    /// Session dispatcher tuning
    pub dispatcher: DispatcherConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Policy tree
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<PolicyConfig>,

    /// Node instances
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeConfig>,

    /// Pipeline connectors
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub connectors: Vec<ConnectorConfig>,

    /// Inside/outside connector pairs
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub casings: Vec<CasingConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| Error::ConfigNotFound {
            path: path.display().to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(Error::from)
    }

    /// Serialize to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// A small two-rack topology, used by `config generate`
    pub fn sample() -> Self {
        let connector = |name: &str, node: &str, policy: Option<PolicyId>, input, output| ConnectorConfig {
            name: name.to_string(),
            node: node.to_string(),
            policy,
            input,
            output: Some(output),
            ..ConnectorConfig::default()
        };

        Self {
            general: GeneralConfig {
                name: "sample".to_string(),
            },
            policies: vec![
                PolicyConfig { id: 1, parent: None },
                PolicyConfig { id: 2, parent: Some(1) },
            ],
            nodes: vec![
                NodeConfig::running("firewall", Some(1)),
                NodeConfig::running("web-filter", Some(1)),
                NodeConfig::running("web-filter", Some(2)),
                NodeConfig::running("http-casing", None),
                NodeConfig::running("virus-blocker", None),
            ],
            connectors: vec![
                ConnectorConfig {
                    affinity: Some(Affinity::Client),
                    ..connector("firewall", "firewall", Some(1), Fitting::OctetStream, Fitting::OctetStream)
                },
                ConnectorConfig {
                    server_ports: Some("80".to_string()),
                    ..connector("web-filter", "web-filter", Some(1), Fitting::HttpTokens, Fitting::HttpTokens)
                },
                ConnectorConfig {
                    server_ports: Some("80".to_string()),
                    ..connector("web-filter", "web-filter", Some(2), Fitting::HttpTokens, Fitting::HttpTokens)
                },
                ConnectorConfig {
                    strength: Some(1),
                    ..connector(
                        "virus-blocker",
                        "virus-blocker",
                        None,
                        Fitting::HttpTokens,
                        Fitting::HttpTokens,
                    )
                },
            ],
            casings: vec![CasingConfig {
                inside: connector(
                    "http-casing-inside",
                    "http-casing",
                    None,
                    Fitting::HttpStream,
                    Fitting::HttpTokens,
                ),
                outside: ConnectorConfig {
                    affinity: Some(Affinity::Server),
                    ..connector(
                        "http-casing-outside",
                        "http-casing",
                        None,
                        Fitting::HttpTokens,
                        Fitting::HttpStream,
                    )
                },
            }],
            ..Self::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for (i, entry) in self.foundry.port_fittings.iter().enumerate() {
            if entry.port == 0 {
                return Err(Error::config_value(
                    format!("foundry.port_fittings[{i}].port"),
                    "Port must be non-zero",
                ));
            }
        }
        if self.dispatcher.tcp_read_buffer_size == 0 {
            return Err(Error::config_value(
                "dispatcher.tcp_read_buffer_size",
                "Must be non-zero",
            ));
        }
        if self.dispatcher.udp_max_packet_size == 0 {
            return Err(Error::config_value(
                "dispatcher.udp_max_packet_size",
                "Must be non-zero",
            ));
        }

        self.logging.level()?;

        self.validate_policies()?;

        let mut node_keys = HashSet::new();
        for node in &self.nodes {
            if let Some(policy) = node.policy {
                if !self.policies.iter().any(|p| p.id == policy) {
                    return Err(Error::UnknownPolicy(policy));
                }
            }
            if !node_keys.insert((node.name.as_str(), node.policy)) {
                return Err(Error::config_value(
                    "nodes",
                    format!("Duplicate node '{}' in policy {:?}", node.name, node.policy),
                ));
            }
        }

        let casing_connectors = self.casings.iter().flat_map(|c| [&c.inside, &c.outside]);
        for connector in self.connectors.iter().chain(casing_connectors) {
            if !node_keys.contains(&(connector.node.as_str(), connector.policy)) {
                return Err(Error::UnknownNode(connector.node.clone()));
            }
            connector.subscription()?;
        }

        Ok(())
    }

    fn validate_policies(&self) -> Result<()> {
        let mut parents: HashMap<PolicyId, Option<PolicyId>> = HashMap::new();
        for policy in &self.policies {
            if parents.insert(policy.id, policy.parent).is_some() {
                return Err(Error::config_value(
                    "policies",
                    format!("Duplicate policy id {}", policy.id),
                ));
            }
        }
        for policy in &self.policies {
            let mut current = policy.parent;
            let mut steps = 0;
            while let Some(parent) = current {
                if !parents.contains_key(&parent) {
                    return Err(Error::UnknownPolicy(parent));
                }
                steps += 1;
                if parent == policy.id || steps > parents.len() {
                    return Err(Error::PolicyCycle(policy.id));
                }
                current = parents[&parent];
            }
        }
        Ok(())
    }
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Topology name
    pub name: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
        }
    }
}

/// Well-known port to starting fitting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortFitting {
    /// TCP server port
    pub port: u16,
    /// Fitting sessions to that port start from
    pub fitting: Fitting,
}

/// Weld settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FoundryConfig {
    /// Seconds before an unused fitting hint is dropped (0 = never)
    pub hint_timeout_secs: u64,
    /// TCP server ports with a protocol-specific starting fitting
    pub port_fittings: Vec<PortFitting>,
}

impl Default for FoundryConfig {
    fn default() -> Self {
        let port_fittings = [ports::FTP, ports::SMTP, ports::HTTP, ports::HTTPS]
            .into_iter()
            .filter_map(|port| Fitting::for_tcp_port(port).map(|fitting| PortFitting { port, fitting }))
            .collect();
        Self {
            hint_timeout_secs: 60,
            port_fittings,
        }
    }
}

impl FoundryConfig {
    /// Port lookup table
    pub fn port_table(&self) -> HashMap<u16, Fitting> {
        self.port_fittings.iter().map(|p| (p.port, p.fitting)).collect()
    }
}

/// Session dispatcher tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Largest TCP chunk handed to the next stage
    pub tcp_read_buffer_size: usize,
    /// Largest UDP packet passed on; larger ones are dropped
    pub udp_max_packet_size: usize,
    /// Keep per-session construction timestamps
    pub detailed_times: bool,
    /// Log every dispatched event on the `weld::events` target
    pub event_log: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tcp_read_buffer_size: 8192,
            udp_max_packet_size: 16384,
            detailed_times: false,
            event_log: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level, used when no verbosity flag is given
    pub level: String,
    /// Log file path (None = stderr only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Enable JSON format logging
    pub json_format: bool,
}

impl LoggingConfig {
    /// Parsed log level
    pub fn level(&self) -> Result<tracing::Level> {
        self.level
            .parse()
            .map_err(|_| Error::config_value("logging.level", format!("Unknown level '{}'", self.level)))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file: None,
            json_format: false,
        }
    }
}

/// One policy rack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Policy id
    pub id: PolicyId,
    /// Parent policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<PolicyId>,
}

/// One node instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// App name
    pub name: String,
    /// Policy rack, unset for services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyId>,
    /// Run state at load
    #[serde(default = "default_node_state")]
    pub state: NodeState,
}

fn default_node_state() -> NodeState {
    NodeState::Running
}

impl NodeConfig {
    /// Running node
    pub fn running(name: &str, policy: Option<PolicyId>) -> Self {
        Self {
            name: name.to_string(),
            policy,
            state: NodeState::Running,
        }
    }
}

/// One pipeline connector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Connector name
    pub name: String,
    /// Owning node's app name
    pub node: String,
    /// Owning node's policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyId>,
    /// Fitting consumed
    pub input: Fitting,
    /// Fitting produced, same as input if unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Fitting>,
    /// Position preference
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    /// Tie-break within the affinity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strength: Option<i32>,
    /// Accepted protocols, all if unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocols: Option<Vec<Protocol>>,
    /// Server port or range, e.g. "80" or "8000-8080"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_ports: Option<String>,
    /// Client port or range
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ports: Option<String>,
    /// Server address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_addr: Option<IpAddr>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            node: String::new(),
            policy: None,
            input: Fitting::OctetStream,
            output: None,
            affinity: None,
            strength: None,
            protocols: None,
            server_ports: None,
            client_ports: None,
            server_addr: None,
        }
    }
}

impl ConnectorConfig {
    /// Fitting produced
    pub fn output_fitting(&self) -> Fitting {
        self.output.unwrap_or(self.input)
    }

    /// Interest filter described by this entry
    pub fn subscription(&self) -> Result<Subscription> {
        let mut subscription = Subscription::all();
        if let Some(ref protocols) = self.protocols {
            subscription.protocols = protocols
                .iter()
                .fold(ProtocolMask::empty(), |mask, p| mask | ProtocolMask::from(*p));
        }
        if let Some(ref ports) = self.server_ports {
            subscription.server_ports = Some(parse_port_range(ports)?);
        }
        if let Some(ref ports) = self.client_ports {
            subscription.client_ports = Some(parse_port_range(ports)?);
        }
        subscription.server_addr = self.server_addr;
        Ok(subscription)
    }
}

/// Inside/outside connector pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasingConfig {
    /// Connector unwrapping the outer protocol
    pub inside: ConnectorConfig,
    /// Connector re-wrapping it
    pub outside: ConnectorConfig,
}

/// Parse "80" or "8000-8080"
pub fn parse_port_range(value: &str) -> Result<RangeInclusive<u16>> {
    let invalid = || Error::config_value("ports", format!("Invalid port range: {value}"));
    let parse = |s: &str| s.trim().parse::<u16>().map_err(|_| invalid());

    let range = match value.split_once('-') {
        Some((start, end)) => parse(start)?..=parse(end)?,
        None => {
            let port = parse(value)?;
            port..=port
        }
    };
    if range.start() > range.end() {
        return Err(invalid());
    }
    Ok(range)
}
