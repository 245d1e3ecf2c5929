//! Chain building
//!
//! Two steps over a priority-sorted connector pool: drop the instances a
//! policy must not see, then extend greedily from a starting fitting.

use crate::connector::PipelineConnector;
use crate::fitting::Fitting;
use crate::node::{NodeManager, NodeState};
use crate::policy::{generation_diff, policy_match, PolicyId, PolicyManager};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::trace;

/// Remove connectors hidden by policy inheritance
///
/// Services always stay. A policy-scoped connector stays only if its
/// node's policy is `policy_id` or an ancestor of it, its app is running
/// in `policy_id`, and no closer instance of the same app exists.
pub fn remove_duplicates(
    policy_id: Option<PolicyId>,
    available: &mut Vec<Arc<PipelineConnector>>,
    nodes: &dyn NodeManager,
    policies: Option<&dyn PolicyManager>,
) {
    let enabled: HashSet<String> = nodes
        .node_instances(policy_id)
        .iter()
        .filter(|n| n.run_state() == NodeState::Running)
        .map(|n| n.name().to_string())
        .collect();

    let mut min_distance: HashMap<String, i32> = HashMap::new();
    let mut candidates = Vec::with_capacity(available.len());

    for connector in available.drain(..) {
        let node = connector.node();
        let Some(node_policy) = node.policy_id() else {
            candidates.push((connector, None));
            continue;
        };

        let distance = generation_diff(policies, policy_id, Some(node_policy));
        if distance < 0 {
            trace!(connector = %connector, node_policy, "Removing connector from unrelated policy");
            continue;
        }
        if !enabled.contains(node.name()) {
            trace!(connector = %connector, "Removing connector of app not enabled in policy");
            continue;
        }

        min_distance
            .entry(node.name().to_string())
            .and_modify(|d| *d = (*d).min(distance))
            .or_insert(distance);
        candidates.push((connector, Some(distance)));
    }

    available.extend(candidates.into_iter().filter_map(|(connector, distance)| {
        let keep = match distance {
            None => true,
            Some(distance) => min_distance
                .get(connector.node().name())
                .map_or(true, |min| distance <= *min),
        };
        if !keep {
            trace!(connector = %connector, "Removing connector shadowed by a closer instance");
        }
        keep.then_some(connector)
    }));
}

/// Extend a chain from `start`, consuming connectors from `available`
///
/// At each step the first connector in priority order whose input is the
/// current fitting and whose node applies to `policy_id` is appended; the
/// chain continues from its output fitting.
pub fn add_pipeline_connectors(
    available: &mut Vec<Arc<PipelineConnector>>,
    start: Fitting,
    policy_id: Option<PolicyId>,
    policies: Option<&dyn PolicyManager>,
) -> Vec<Arc<PipelineConnector>> {
    let mut chain = Vec::new();
    let mut fitting = start;

    while let Some(pos) = available.iter().position(|c| {
        c.input_fitting() == fitting && policy_match(policies, c.node().policy_id(), policy_id)
    }) {
        let connector = available.remove(pos);
        trace!(%fitting, connector = %connector, "Adding connector");
        fitting = connector.output_fitting();
        chain.push(connector);
    }

    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Affinity;
    use crate::node::{Node, NodeTable};
    use crate::policy::PolicyTree;

    struct Fixture {
        tree: Arc<PolicyTree>,
        nodes: NodeTable,
    }

    impl Fixture {
        /// Policy 1 with child 2
        fn new() -> Self {
            let tree = Arc::new(PolicyTree::new());
            tree.insert(1, None).unwrap();
            tree.insert(2, Some(1)).unwrap();
            let nodes = NodeTable::with_policies(tree.clone());
            Self { tree, nodes }
        }

        fn connector(
            &self,
            name: &str,
            policy: Option<PolicyId>,
            state: NodeState,
            input: Fitting,
            output: Fitting,
        ) -> Arc<PipelineConnector> {
            let node: Arc<dyn Node> = self.nodes.install(name, policy, state);
            PipelineConnector::builder(name, node)
                .fittings(input, output)
                .build()
        }

        fn policies(&self) -> Option<&dyn PolicyManager> {
            Some(self.tree.as_ref())
        }
    }

    #[test]
    fn test_services_always_kept() {
        let f = Fixture::new();
        let svc = f.connector("reports", None, NodeState::Stopped, Fitting::OctetStream, Fitting::OctetStream);
        let mut available = vec![svc];
        remove_duplicates(Some(2), &mut available, &f.nodes, f.policies());
        assert_eq!(available.len(), 1);
    }

    #[test]
    fn test_closest_instance_wins() {
        let f = Fixture::new();
        let parent = f.connector("web-filter", Some(1), NodeState::Running, Fitting::HttpTokens, Fitting::HttpTokens);
        let child = f.connector("web-filter", Some(2), NodeState::Running, Fitting::HttpTokens, Fitting::HttpTokens);

        let mut available = vec![Arc::clone(&parent), Arc::clone(&child)];
        remove_duplicates(Some(2), &mut available, &f.nodes, f.policies());
        assert_eq!(available.len(), 1);
        assert!(Arc::ptr_eq(&available[0], &child));

        // The parent rack only sees its own instance
        let mut available = vec![Arc::clone(&parent), child];
        remove_duplicates(Some(1), &mut available, &f.nodes, f.policies());
        assert_eq!(available.len(), 1);
        assert!(Arc::ptr_eq(&available[0], &parent));
    }

    #[test]
    fn test_inherited_when_child_has_no_instance() {
        let f = Fixture::new();
        let parent = f.connector("firewall", Some(1), NodeState::Running, Fitting::OctetStream, Fitting::OctetStream);
        let mut available = vec![parent];
        remove_duplicates(Some(2), &mut available, &f.nodes, f.policies());
        assert_eq!(available.len(), 1);
    }

    #[test]
    fn test_stopped_in_child_not_inherited() {
        let f = Fixture::new();
        let parent = f.connector("web-filter", Some(1), NodeState::Running, Fitting::HttpTokens, Fitting::HttpTokens);
        f.nodes.install("web-filter", Some(2), NodeState::Stopped);

        let mut available = vec![parent];
        remove_duplicates(Some(2), &mut available, &f.nodes, f.policies());
        assert!(available.is_empty());
    }

    #[test]
    fn test_no_policy_session_drops_scoped_connectors() {
        let f = Fixture::new();
        let scoped = f.connector("firewall", Some(1), NodeState::Running, Fitting::OctetStream, Fitting::OctetStream);
        let mut available = vec![scoped];
        remove_duplicates(None, &mut available, &f.nodes, f.policies());
        assert!(available.is_empty());
    }

    #[test]
    fn test_greedy_extension_follows_outputs() {
        let f = Fixture::new();
        let casing_in = f.connector("casing-in", None, NodeState::Running, Fitting::HttpStream, Fitting::HttpTokens);
        let filter = f.connector("filter", None, NodeState::Running, Fitting::HttpTokens, Fitting::HttpTokens);
        let casing_out = f.connector("casing-out", None, NodeState::Running, Fitting::HttpTokens, Fitting::HttpStream);
        let octet = f.connector("octet", None, NodeState::Running, Fitting::OctetStream, Fitting::OctetStream);

        let mut available = vec![casing_in, filter, casing_out, Arc::clone(&octet)];
        let chain = add_pipeline_connectors(&mut available, Fitting::HttpStream, Some(1), f.policies());
        let names: Vec<&str> = chain.iter().map(|c| c.name()).collect();

        assert_eq!(names, vec!["casing-in", "filter", "casing-out"]);
        assert_eq!(available.len(), 1);
        assert!(Arc::ptr_eq(&available[0], &octet));
    }

    #[test]
    fn test_extension_skips_unmatched_policy() {
        let f = Fixture::new();
        let child_only = f.connector("child-app", Some(2), NodeState::Running, Fitting::OctetStream, Fitting::OctetStream);
        let mut available = vec![child_only];
        let chain = add_pipeline_connectors(&mut available, Fitting::OctetStream, Some(1), f.policies());
        assert!(chain.is_empty());
    }

    #[test]
    fn test_extension_terminates_on_cycle() {
        let f = Fixture::new();
        let a = f.connector("a", None, NodeState::Running, Fitting::OctetStream, Fitting::OctetStream);
        let b = f.connector("b", None, NodeState::Running, Fitting::OctetStream, Fitting::OctetStream);
        let mut available = vec![a, b];
        let chain = add_pipeline_connectors(&mut available, Fitting::OctetStream, None, None);
        assert_eq!(chain.len(), 2);
        assert!(available.is_empty());
    }

    #[test]
    fn test_priority_decides_between_candidates() {
        let f = Fixture::new();
        let node: Arc<dyn Node> = f.nodes.install("x", None, NodeState::Running);
        let server = PipelineConnector::builder("server", Arc::clone(&node))
            .affinity(Affinity::Server)
            .build();
        let client = PipelineConnector::builder("client", node)
            .affinity(Affinity::Client)
            .build();

        let mut available = vec![server, client];
        available.sort_by_key(|c| c.priority());
        let chain = add_pipeline_connectors(&mut available, Fitting::OctetStream, None, None);
        assert_eq!(chain[0].name(), "client");
        assert_eq!(chain[1].name(), "server");
    }
}
