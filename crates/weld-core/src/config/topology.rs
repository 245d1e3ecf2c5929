//! Topology loading
//!
//! Turns the `[[policies]]`, `[[nodes]]`, `[[connectors]]` and
//! `[[casings]]` tables of a [`Config`] into a live foundry.

use super::{Config, ConnectorConfig};
use crate::connector::PipelineConnector;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::foundry::PipelineFoundry;
use crate::node::{Node, NodeState, NodeTable};
use crate::policy::{PolicyManager, PolicyTree};
use crate::transport::Transport;
use std::sync::Arc;
use tracing::{debug, info};

/// Loaded policy tree, nodes and registered connectors
pub struct Topology {
    policies: Arc<PolicyTree>,
    nodes: Arc<NodeTable>,
    foundry: Arc<PipelineFoundry>,
    transport: Arc<dyn Transport>,
    connectors: Vec<Arc<PipelineConnector>>,
}

impl Topology {
    /// Validate `config` and build everything it describes
    ///
    /// Connectors of nodes that are not running are built but not
    /// registered.
    pub fn build(config: &Config, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let policies = Arc::new(PolicyTree::new());
        let mut pending: Vec<_> = config.policies.iter().collect();
        while !pending.is_empty() {
            let before = pending.len();
            pending.retain(|p| {
                let ready = p.parent.map_or(true, |parent| policies.contains(parent));
                // Parent not inserted yet: try again next round
                !(ready && policies.insert(p.id, p.parent).is_ok())
            });
            if pending.len() == before {
                return Err(Error::UnknownPolicy(pending[0].parent.unwrap_or(pending[0].id)));
            }
        }

        let manager: Arc<dyn PolicyManager> = policies.clone();
        let nodes = Arc::new(NodeTable::with_policies(Arc::clone(&manager)));
        for node in &config.nodes {
            nodes.install(node.name.as_str(), node.policy, node.state);
        }

        let foundry = Arc::new(
            PipelineFoundry::new(&config.foundry, nodes.clone())
                .with_policy_manager(manager)
                .with_transport(Arc::clone(&transport))
                .with_dispatcher_config(config.dispatcher.clone()),
        );

        let mut topology = Self {
            policies,
            nodes,
            foundry,
            transport,
            connectors: Vec::new(),
        };

        for entry in &config.connectors {
            let (connector, running) = topology.build_connector(entry)?;
            if running {
                topology.foundry.register_pipeline_connector(Arc::clone(&connector));
            } else {
                debug!(connector = %entry.name, "Node not running, connector not registered");
            }
            topology.connectors.push(connector);
        }

        for casing in &config.casings {
            let (inside, inside_running) = topology.build_connector(&casing.inside)?;
            let (outside, outside_running) = topology.build_connector(&casing.outside)?;
            if inside_running && outside_running {
                topology
                    .foundry
                    .register_casing(Arc::clone(&inside), Arc::clone(&outside));
            }
            topology.connectors.push(inside);
            topology.connectors.push(outside);
        }

        info!(
            name = %config.general.name,
            policies = topology.policies.len(),
            nodes = topology.nodes.len(),
            registered = topology.foundry.connectors().len(),
            "Loaded topology"
        );
        Ok(topology)
    }

    fn build_connector(&self, entry: &ConnectorConfig) -> Result<(Arc<PipelineConnector>, bool)> {
        let node = self
            .nodes
            .find(&entry.node, entry.policy)
            .ok_or_else(|| Error::UnknownNode(entry.node.clone()))?;
        let running = node.run_state() == NodeState::Running;

        let mut builder = self
            .foundry
            .connector(entry.name.as_str(), node as Arc<dyn Node>)
            .subscription(entry.subscription()?)
            .fittings(entry.input, entry.output_fitting());
        if let Some(affinity) = entry.affinity {
            builder = builder.affinity(affinity);
        }
        if let Some(strength) = entry.strength {
            builder = builder.strength(strength);
        }
        Ok((builder.build(), running))
    }

    /// Policy tree
    pub fn policies(&self) -> &Arc<PolicyTree> {
        &self.policies
    }

    /// Node instances
    pub fn nodes(&self) -> &Arc<NodeTable> {
        &self.nodes
    }

    /// Foundry with all running connectors registered
    pub fn foundry(&self) -> &Arc<PipelineFoundry> {
        &self.foundry
    }

    /// Every connector built, registered or not, in config order
    pub fn connectors(&self) -> &[Arc<PipelineConnector>] {
        &self.connectors
    }

    /// First connector with the given name
    pub fn connector(&self, name: &str) -> Option<&Arc<PipelineConnector>> {
        self.connectors.iter().find(|c| c.name() == name)
    }

    /// Engine driving this topology's foundry
    pub fn engine(&self) -> Engine {
        Engine::new(Arc::clone(&self.foundry), Arc::clone(&self.transport))
    }
}
