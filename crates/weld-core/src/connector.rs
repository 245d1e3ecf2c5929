//! Pipeline connectors
//!
//! A connector is one node's subscription to traffic of an input fitting,
//! producing an output fitting. Each connector owns the [`Dispatcher`]
//! that routes session events to the node's listener.

use crate::config::DispatcherConfig;
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::fitting::Fitting;
use crate::handler::SessionEventHandler;
use crate::node::Node;
use crate::transport::{NullTransport, Transport};
use crate::tuple::{ProtocolMask, SessionTuple};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Unique connector id
pub type ConnectorId = u64;

/// Coarse position preference within a chain
///
/// Chains are ordered by affinity first (client side, then middle, then
/// server side) and by strength within the same affinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Affinity {
    /// Close to the client
    Client,
    /// Anywhere in the middle
    #[default]
    Middle,
    /// Close to the server
    Server,
}

impl Affinity {
    /// Numeric rank used for ordering
    pub fn num_value(self) -> i32 {
        match self {
            Affinity::Client => 0,
            Affinity::Middle => 1,
            Affinity::Server => 2,
        }
    }

    /// Lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            Affinity::Client => "client",
            Affinity::Middle => "middle",
            Affinity::Server => "server",
        }
    }
}

impl fmt::Display for Affinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Affinity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "client" => Ok(Affinity::Client),
            "middle" => Ok(Affinity::Middle),
            "server" => Ok(Affinity::Server),
            _ => Err(Error::config_value("affinity", format!("Unknown affinity: {s}"))),
        }
    }
}

/// Interest filter of a connector
///
/// An empty subscription (the default) matches every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Accepted protocols
    pub protocols: ProtocolMask,
    /// Accepted server ports, any if unset
    pub server_ports: Option<RangeInclusive<u16>>,
    /// Accepted client ports, any if unset
    pub client_ports: Option<RangeInclusive<u16>>,
    /// Accepted server address, any if unset
    pub server_addr: Option<IpAddr>,
}

impl Default for Subscription {
    fn default() -> Self {
        Self::all()
    }
}

impl Subscription {
    /// Match every session
    pub fn all() -> Self {
        Self {
            protocols: ProtocolMask::all(),
            server_ports: None,
            client_ports: None,
            server_addr: None,
        }
    }

    /// Match TCP sessions only
    pub fn tcp() -> Self {
        Self {
            protocols: ProtocolMask::TCP,
            ..Self::all()
        }
    }

    /// Match UDP sessions only
    pub fn udp() -> Self {
        Self {
            protocols: ProtocolMask::UDP,
            ..Self::all()
        }
    }

    /// Restrict to a server port range
    pub fn with_server_ports(mut self, ports: RangeInclusive<u16>) -> Self {
        self.server_ports = Some(ports);
        self
    }

    /// Restrict to a client port range
    pub fn with_client_ports(mut self, ports: RangeInclusive<u16>) -> Self {
        self.client_ports = Some(ports);
        self
    }

    /// Restrict to one server address
    pub fn with_server_addr(mut self, addr: IpAddr) -> Self {
        self.server_addr = Some(addr);
        self
    }

    /// Whether a session tuple is of interest
    pub fn matches(&self, tuple: &SessionTuple) -> bool {
        if !self.protocols.accepts(tuple.protocol) {
            return false;
        }
        if let Some(ref ports) = self.server_ports {
            if !ports.contains(&tuple.server_port) {
                return false;
            }
        }
        if let Some(ref ports) = self.client_ports {
            if !ports.contains(&tuple.client_port) {
                return false;
            }
        }
        if let Some(addr) = self.server_addr {
            if addr != tuple.server_addr {
                return false;
            }
        }
        true
    }
}

static NEXT_CONNECTOR_ID: AtomicU64 = AtomicU64::new(1);

/// One node's attachment point in the pipeline
pub struct PipelineConnector {
    id: ConnectorId,
    name: String,
    node: Arc<dyn Node>,
    subscription: Subscription,
    dispatcher: Arc<Dispatcher>,
    input_fitting: Fitting,
    output_fitting: Fitting,
    affinity: Affinity,
    affinity_strength: i32,
}

impl PipelineConnector {
    /// Start building a connector for `node`
    pub fn builder(name: impl Into<String>, node: Arc<dyn Node>) -> ConnectorBuilder {
        ConnectorBuilder::new(name, node)
    }

    /// Unique id
    pub fn id(&self) -> ConnectorId {
        self.id
    }

    /// Connector name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning node
    pub fn node(&self) -> &Arc<dyn Node> {
        &self.node
    }

    /// Interest filter
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Dispatcher routing this connector's session events
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Fitting consumed
    pub fn input_fitting(&self) -> Fitting {
        self.input_fitting
    }

    /// Fitting produced
    pub fn output_fitting(&self) -> Fitting {
        self.output_fitting
    }

    /// Position preference
    pub fn affinity(&self) -> Affinity {
        self.affinity
    }

    /// Tie-break within the same affinity, lower first
    pub fn affinity_strength(&self) -> i32 {
        self.affinity_strength
    }

    /// Sort key of the registry: affinity rank, then strength
    pub fn priority(&self) -> (i32, i32) {
        (self.affinity.num_value(), self.affinity_strength)
    }

    /// Whether the node is interested in this session
    pub fn matches(&self, tuple: &SessionTuple) -> bool {
        self.subscription.matches(tuple)
    }
}

impl fmt::Display for PipelineConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}:{}]",
            self.name,
            self.input_fitting,
            self.output_fitting
        )
    }
}

impl fmt::Debug for PipelineConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConnector")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("node", &self.node.name())
            .field("policy", &self.node.policy_id())
            .field("input", &self.input_fitting)
            .field("output", &self.output_fitting)
            .field("affinity", &self.affinity)
            .field("strength", &self.affinity_strength)
            .finish_non_exhaustive()
    }
}

/// Builder for [`PipelineConnector`]
pub struct ConnectorBuilder {
    name: String,
    node: Arc<dyn Node>,
    subscription: Subscription,
    listener: Option<Arc<dyn SessionEventHandler>>,
    transport: Arc<dyn Transport>,
    dispatcher_config: DispatcherConfig,
    input_fitting: Fitting,
    output_fitting: Fitting,
    affinity: Option<Affinity>,
    affinity_strength: Option<i32>,
}

impl ConnectorBuilder {
    fn new(name: impl Into<String>, node: Arc<dyn Node>) -> Self {
        Self {
            name: name.into(),
            node,
            subscription: Subscription::all(),
            listener: None,
            transport: Arc::new(NullTransport),
            dispatcher_config: DispatcherConfig::default(),
            input_fitting: Fitting::OctetStream,
            output_fitting: Fitting::OctetStream,
            affinity: None,
            affinity_strength: None,
        }
    }

    /// Set the interest filter
    pub fn subscription(mut self, subscription: Subscription) -> Self {
        self.subscription = subscription;
        self
    }

    /// Set input and output fitting
    pub fn fittings(mut self, input: Fitting, output: Fitting) -> Self {
        self.input_fitting = input;
        self.output_fitting = output;
        self
    }

    /// Set the position preference
    pub fn affinity(mut self, affinity: Affinity) -> Self {
        self.affinity = Some(affinity);
        self
    }

    /// Set the tie-break strength
    pub fn strength(mut self, strength: i32) -> Self {
        self.affinity_strength = Some(strength);
        self
    }

    /// Set the node's session event listener
    pub fn listener(mut self, listener: Arc<dyn SessionEventHandler>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Set the transport notified when sessions are removed
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Set dispatcher tuning
    pub fn dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher_config = config;
        self
    }

    /// Build the connector and its dispatcher
    pub fn build(self) -> Arc<PipelineConnector> {
        let dispatcher = Dispatcher::new(Arc::clone(&self.node), self.transport, self.dispatcher_config);
        dispatcher.set_session_event_listener(self.listener);

        Arc::new(PipelineConnector {
            id: NEXT_CONNECTOR_ID.fetch_add(1, Ordering::Relaxed),
            name: self.name,
            node: self.node,
            subscription: self.subscription,
            dispatcher: Arc::new(dispatcher),
            input_fitting: self.input_fitting,
            output_fitting: self.output_fitting,
            affinity: self.affinity.unwrap_or_default(),
            affinity_strength: self.affinity_strength.unwrap_or(0),
        })
    }
}
