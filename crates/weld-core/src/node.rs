//! Node (app instance) collaborator
//!
//! The foundry only needs three facts about a node: its name, the policy
//! rack it lives in, and whether it is running. [`NodeManager`] answers
//! "which nodes are in effect for this policy" for de-duplication.

use crate::policy::{PolicyId, PolicyManager};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Unique node instance id
pub type NodeId = u64;

/// Run state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Installed, never started
    #[default]
    Initialized,
    /// Started and processing sessions
    Running,
    /// Installed but turned off
    Stopped,
    /// Removed from its rack
    Destroyed,
}

/// A node instance as seen by the pipeline
pub trait Node: Send + Sync + fmt::Debug {
    /// Unique instance id
    fn node_id(&self) -> NodeId;

    /// App name, shared by every instance of the same app
    fn name(&self) -> &str;

    /// Policy rack, `None` for services that apply to all policies
    fn policy_id(&self) -> Option<PolicyId>;

    /// Current run state
    fn run_state(&self) -> NodeState;
}

/// Lookup of node instances by policy
pub trait NodeManager: Send + Sync {
    /// Nodes in effect for `policy_id`
    ///
    /// These are the policy's own nodes plus those inherited from its
    /// ancestors. For each app name only the closest instance is returned,
    /// so a stopped child instance shadows a running parent instance.
    fn node_instances(&self, policy_id: Option<PolicyId>) -> Vec<Arc<dyn Node>>;
}

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// In-memory node instance
#[derive(Debug)]
pub struct NodeInstance {
    id: NodeId,
    name: String,
    policy_id: Option<PolicyId>,
    state: RwLock<NodeState>,
}

impl NodeInstance {
    /// Create a node instance with a fresh id
    pub fn new(name: impl Into<String>, policy_id: Option<PolicyId>, state: NodeState) -> Self {
        Self {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            policy_id,
            state: RwLock::new(state),
        }
    }

    /// Change the run state
    pub fn set_state(&self, state: NodeState) {
        *self.state.write() = state;
    }
}

impl Node for NodeInstance {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn policy_id(&self) -> Option<PolicyId> {
        self.policy_id
    }

    fn run_state(&self) -> NodeState {
        *self.state.read()
    }
}

/// In-memory [`NodeManager`]
#[derive(Default)]
pub struct NodeTable {
    nodes: RwLock<Vec<Arc<NodeInstance>>>,
    policies: Option<Arc<dyn PolicyManager>>,
}

impl fmt::Debug for NodeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeTable")
            .field("nodes", &self.nodes.read().len())
            .field("policies", &self.policies.is_some())
            .finish()
    }
}

impl NodeTable {
    /// Create an empty table without policy inheritance
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty table resolving inheritance through `policies`
    pub fn with_policies(policies: Arc<dyn PolicyManager>) -> Self {
        Self {
            nodes: RwLock::new(Vec::new()),
            policies: Some(policies),
        }
    }

    /// Install a node and return its handle
    pub fn install(
        &self,
        name: impl Into<String>,
        policy_id: Option<PolicyId>,
        state: NodeState,
    ) -> Arc<NodeInstance> {
        let node = Arc::new(NodeInstance::new(name, policy_id, state));
        self.nodes.write().push(Arc::clone(&node));
        node
    }

    /// Remove a node by id
    pub fn uninstall(&self, id: NodeId) -> Option<Arc<NodeInstance>> {
        let mut nodes = self.nodes.write();
        let pos = nodes.iter().position(|n| n.id == id)?;
        Some(nodes.remove(pos))
    }

    /// Find a node by app name and policy
    pub fn find(&self, name: &str, policy_id: Option<PolicyId>) -> Option<Arc<NodeInstance>> {
        self.nodes
            .read()
            .iter()
            .find(|n| n.name == name && n.policy_id == policy_id)
            .cloned()
    }

    /// Nodes installed directly in `policy_id`
    pub fn own_instances(&self, policy_id: Option<PolicyId>) -> Vec<Arc<NodeInstance>> {
        self.nodes
            .read()
            .iter()
            .filter(|n| n.policy_id == policy_id)
            .cloned()
            .collect()
    }

    /// All installed nodes
    pub fn all(&self) -> Vec<Arc<NodeInstance>> {
        self.nodes.read().clone()
    }

    /// Number of installed nodes
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// Check if no nodes are installed
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

impl NodeManager for NodeTable {
    fn node_instances(&self, policy_id: Option<PolicyId>) -> Vec<Arc<dyn Node>> {
        let nodes = self.nodes.read();
        let mut seen = HashSet::new();
        let mut effective: Vec<Arc<dyn Node>> = Vec::new();

        let max_depth = self.policies.as_ref().map_or(1, |p| p.max_depth());
        let mut current = policy_id;
        for _ in 0..max_depth {
            for node in nodes.iter().filter(|n| n.policy_id == current) {
                if seen.insert(node.name.as_str()) {
                    effective.push(Arc::clone(node) as Arc<dyn Node>);
                }
            }
            current = match (current, &self.policies) {
                (Some(id), Some(policies)) => policies.parent_policy_id(id),
                _ => None,
            };
            if current.is_none() {
                break;
            }
        }
        effective
    }
}
