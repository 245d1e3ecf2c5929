//! Integration tests for the pipeline foundry

use mockall::mock;
use proptest::prelude::*;
use std::net::SocketAddr;
use std::sync::Arc;
use weld_core::config::FoundryConfig;
use weld_core::node::NodeInstance;
use weld_core::tuple::Protocol;
use weld_core::{
    Affinity, Fitting, Node, NodeState, NodeTable, PipelineConnector, PipelineFoundry, PolicyId,
    PolicyManager, PolicyTree, SessionTuple, Subscription,
};

mock! {
    Policies {}

    impl PolicyManager for Policies {
        fn parent_policy_id(&self, policy_id: PolicyId) -> Option<PolicyId>;
    }
}

struct Rig {
    tree: Arc<PolicyTree>,
    nodes: Arc<NodeTable>,
    foundry: PipelineFoundry,
}

impl Rig {
    /// Policy 1 with child 2 and grandchild 3
    fn new() -> Self {
        let tree = Arc::new(PolicyTree::new());
        tree.insert(1, None).unwrap();
        tree.insert(2, Some(1)).unwrap();
        tree.insert(3, Some(2)).unwrap();
        let nodes = Arc::new(NodeTable::with_policies(tree.clone()));
        let foundry =
            PipelineFoundry::new(&FoundryConfig::default(), nodes.clone()).with_policy_manager(tree.clone());
        Self { tree, nodes, foundry }
    }

    fn node(&self, name: &str, policy: Option<PolicyId>, state: NodeState) -> Arc<NodeInstance> {
        self.nodes.install(name, policy, state)
    }

    fn connector(
        &self,
        name: &str,
        node: &Arc<NodeInstance>,
        input: Fitting,
        output: Fitting,
    ) -> Arc<PipelineConnector> {
        self.foundry
            .connector(name, Arc::clone(node) as Arc<dyn Node>)
            .fittings(input, output)
            .build()
    }
}

fn tuple(server_port: u16) -> SessionTuple {
    SessionTuple::new(
        Protocol::Tcp,
        "192.168.1.100:54321".parse().unwrap(),
        SocketAddr::new("93.184.216.34".parse().unwrap(), server_port),
    )
}

fn names(chain: &[Arc<PipelineConnector>]) -> Vec<&str> {
    chain.iter().map(|c| c.name()).collect()
}

// ============ Determinism & Cache Tests ============

#[test]
fn test_weld_pipeline_deterministic() {
    let rig = Rig::new();
    let fw = rig.node("firewall", Some(1), NodeState::Running);
    let ips = rig.node("ips", None, NodeState::Running);
    rig.foundry
        .register_pipeline_connector(rig.connector("firewall", &fw, Fitting::OctetStream, Fitting::OctetStream));
    rig.foundry
        .register_pipeline_connector(rig.connector("ips", &ips, Fitting::OctetStream, Fitting::OctetStream));

    let first = rig.foundry.weld_pipeline(Some(2), Fitting::OctetStream);
    for _ in 0..10 {
        let again = rig.foundry.weld_pipeline(Some(2), Fitting::OctetStream);
        assert_eq!(names(&again), names(&first));
    }
    assert_eq!(rig.foundry.cached_chains(), 1);
}

#[test]
fn test_deregister_invalidates_cache() {
    let rig = Rig::new();
    let node = rig.node("spam-blocker", Some(1), NodeState::Running);
    let a = rig.connector("spam-blocker", &node, Fitting::OctetStream, Fitting::OctetStream);

    rig.foundry.register_pipeline_connector(Arc::clone(&a));
    assert_eq!(names(&rig.foundry.weld_pipeline(Some(1), Fitting::OctetStream)), vec!["spam-blocker"]);

    rig.foundry.deregister_pipeline_connector(&a);
    let chain = rig.foundry.weld_pipeline(Some(1), Fitting::OctetStream);
    assert!(chain.iter().all(|c| !Arc::ptr_eq(c, &a)));
}

#[test]
fn test_register_invalidates_cache() {
    let rig = Rig::new();
    assert!(rig.foundry.weld_pipeline(Some(1), Fitting::OctetStream).is_empty());

    let node = rig.node("firewall", Some(1), NodeState::Running);
    rig.foundry
        .register_pipeline_connector(rig.connector("firewall", &node, Fitting::OctetStream, Fitting::OctetStream));
    assert_eq!(rig.foundry.weld_pipeline(Some(1), Fitting::OctetStream).len(), 1);
}

#[test]
fn test_casing_register_and_deregister() {
    let rig = Rig::new();
    let casing = rig.node("http-casing", None, NodeState::Running);
    let inside = rig.connector("http-inside", &casing, Fitting::HttpStream, Fitting::HttpTokens);
    let outside = rig.connector("http-outside", &casing, Fitting::HttpTokens, Fitting::HttpStream);

    assert!(rig.foundry.register_casing(Arc::clone(&inside), Arc::clone(&outside)));
    assert_eq!(
        names(&rig.foundry.weld_pipeline(Some(1), Fitting::HttpStream)),
        vec!["http-inside", "http-outside"]
    );

    assert!(rig.foundry.deregister_casing(&inside, &outside));
    assert!(rig.foundry.weld_pipeline(Some(1), Fitting::HttpStream).is_empty());
    assert!(rig.foundry.connectors().is_empty());
}

// ============ Priority Tests ============

#[test]
fn test_client_affinity_first_regardless_of_order() {
    for client_first in [true, false] {
        let rig = Rig::new();
        let node = rig.node("router", None, NodeState::Running);
        let client = rig
            .foundry
            .connector("client", Arc::clone(&node) as Arc<dyn Node>)
            .affinity(Affinity::Client)
            .build();
        let server = rig
            .foundry
            .connector("server", node as Arc<dyn Node>)
            .affinity(Affinity::Server)
            .build();

        if client_first {
            rig.foundry.register_pipeline_connector(client);
            rig.foundry.register_pipeline_connector(server);
        } else {
            rig.foundry.register_pipeline_connector(server);
            rig.foundry.register_pipeline_connector(client);
        }

        let chain = rig.foundry.weld_pipeline(None, Fitting::OctetStream);
        assert_eq!(names(&chain), vec!["client", "server"]);
    }
}

proptest! {
    #[test]
    fn prop_chain_order_independent_of_registration(order in Just(vec![0usize, 1, 2, 3, 4]).prop_shuffle()) {
        let rig = Rig::new();
        let specs = [
            ("server-low", Affinity::Server, 0),
            ("client-high", Affinity::Client, 5),
            ("middle", Affinity::Middle, 0),
            ("client-low", Affinity::Client, -2),
            ("middle-strong", Affinity::Middle, 3),
        ];
        let node: Arc<dyn Node> = rig.node("svc", None, NodeState::Running);
        for i in order {
            let (name, affinity, strength) = specs[i];
            let connector = rig
                .foundry
                .connector(name, Arc::clone(&node))
                .affinity(affinity)
                .strength(strength)
                .build();
            rig.foundry.register_pipeline_connector(connector);
        }

        let chain = rig.foundry.weld_pipeline(None, Fitting::OctetStream);
        prop_assert_eq!(
            names(&chain),
            vec!["client-low", "client-high", "middle", "middle-strong", "server-low"]
        );
    }
}

// ============ Policy Inheritance Tests ============

#[test]
fn test_closest_instance_wins() {
    let rig = Rig::new();
    let parent = rig.node("X", Some(1), NodeState::Running);
    let child = rig.node("X", Some(2), NodeState::Running);
    let parent_conn = rig.connector("X", &parent, Fitting::OctetStream, Fitting::OctetStream);
    let child_conn = rig.connector("X", &child, Fitting::OctetStream, Fitting::OctetStream);
    rig.foundry.register_pipeline_connector(Arc::clone(&parent_conn));
    rig.foundry.register_pipeline_connector(Arc::clone(&child_conn));

    let chain = rig.foundry.weld_pipeline(Some(2), Fitting::OctetStream);
    assert_eq!(chain.len(), 1);
    assert!(Arc::ptr_eq(&chain[0], &child_conn));

    // The grandchild inherits the closer of the two
    let chain = rig.foundry.weld_pipeline(Some(3), Fitting::OctetStream);
    assert_eq!(chain.len(), 1);
    assert!(Arc::ptr_eq(&chain[0], &child_conn));

    let chain = rig.foundry.weld_pipeline(Some(1), Fitting::OctetStream);
    assert_eq!(chain.len(), 1);
    assert!(Arc::ptr_eq(&chain[0], &parent_conn));
}

#[test]
fn test_disabled_in_child_not_inherited() {
    let rig = Rig::new();
    let parent = rig.node("X", Some(1), NodeState::Running);
    rig.node("X", Some(2), NodeState::Stopped);
    rig.foundry
        .register_pipeline_connector(rig.connector("X", &parent, Fitting::OctetStream, Fitting::OctetStream));

    assert!(rig.foundry.weld_pipeline(Some(2), Fitting::OctetStream).is_empty());
    assert!(rig.foundry.weld_pipeline(Some(3), Fitting::OctetStream).is_empty());
    assert_eq!(rig.foundry.weld_pipeline(Some(1), Fitting::OctetStream).len(), 1);
}

#[test]
fn test_unrelated_policy_excluded() {
    let rig = Rig::new();
    rig.tree.insert(9, None).unwrap();
    let other = rig.node("X", Some(9), NodeState::Running);
    rig.foundry
        .register_pipeline_connector(rig.connector("X", &other, Fitting::OctetStream, Fitting::OctetStream));
    assert!(rig.foundry.weld_pipeline(Some(2), Fitting::OctetStream).is_empty());
}

#[test]
fn test_policy_match() {
    let rig = Rig::new();
    assert!(rig.foundry.policy_match(None, Some(2)));
    assert!(rig.foundry.policy_match(None, None));
    assert!(!rig.foundry.policy_match(Some(1), None));
    assert!(rig.foundry.policy_match(Some(2), Some(2)));
    assert!(rig.foundry.policy_match(Some(1), Some(3)));
    assert!(!rig.foundry.policy_match(Some(3), Some(1)));
}

#[test]
fn test_policy_match_through_mock_manager() {
    let mut policies = MockPolicies::new();
    policies
        .expect_parent_policy_id()
        .returning(|id| match id {
            30 => Some(20),
            20 => Some(10),
            _ => None,
        });

    let foundry = PipelineFoundry::new(&FoundryConfig::default(), Arc::new(NodeTable::new()))
        .with_policy_manager(Arc::new(policies));
    assert!(foundry.policy_match(Some(10), Some(30)));
    assert!(!foundry.policy_match(Some(30), Some(10)));
    assert_eq!(foundry.policy_generation_diff(Some(30), Some(10)), 2);
    assert_eq!(foundry.policy_generation_diff(Some(10), Some(30)), -1);
    assert_eq!(foundry.policy_generation_diff(Some(30), None), -1);
}

#[test]
fn test_mock_manager_with_cycle_terminates() {
    let mut policies = MockPolicies::new();
    policies
        .expect_parent_policy_id()
        .returning(|id| if id == 1 { Some(2) } else { Some(1) });

    let foundry = PipelineFoundry::new(&FoundryConfig::default(), Arc::new(NodeTable::new()))
        .with_policy_manager(Arc::new(policies));
    assert!(!foundry.policy_match(Some(7), Some(1)));
    assert_eq!(foundry.policy_generation_diff(Some(1), Some(7)), -1);
}

// ============ Fitting Tests ============

#[test]
fn test_well_known_port_starts_from_protocol_fitting() {
    let rig = Rig::new();
    let casing = rig.node("http-casing", None, NodeState::Running);
    let octet = rig.node("firewall", None, NodeState::Running);
    rig.foundry.register_casing(
        rig.connector("http-inside", &casing, Fitting::HttpStream, Fitting::HttpTokens),
        rig.connector("http-outside", &casing, Fitting::HttpTokens, Fitting::HttpStream),
    );
    rig.foundry
        .register_pipeline_connector(rig.connector("firewall", &octet, Fitting::OctetStream, Fitting::OctetStream));

    let chain = rig.foundry.weld(1, &tuple(80), Some(1));
    assert_eq!(names(&chain), vec!["http-inside", "http-outside", "firewall"]);

    let chain = rig.foundry.weld(2, &tuple(12345), Some(1));
    assert_eq!(names(&chain), vec!["firewall"]);
}

#[test]
fn test_fitting_hint_consumed_once() {
    let rig = Rig::new();
    let ftp = rig.node("ftp-casing", None, NodeState::Running);
    rig.foundry.register_pipeline_connector(rig.connector(
        "ftp-data",
        &ftp,
        Fitting::FtpDataStream,
        Fitting::FtpDataStream,
    ));

    let data_conn = tuple(20000);
    rig.foundry
        .add_connection_fitting_hint(data_conn.server(), Fitting::FtpDataStream);
    assert_eq!(rig.foundry.pending_hints(), 1);

    assert_eq!(names(&rig.foundry.weld(1, &data_conn, Some(1))), vec!["ftp-data"]);
    assert_eq!(rig.foundry.pending_hints(), 0);
    assert!(rig.foundry.weld(2, &data_conn, Some(1)).is_empty());
}

#[test]
fn test_subscription_filters_after_weld() {
    let rig = Rig::new();
    let node = rig.node("dns-filter", None, NodeState::Running);
    let connector = rig
        .foundry
        .connector("dns-filter", node as Arc<dyn Node>)
        .subscription(Subscription::udp().with_server_ports(53..=53))
        .build();
    rig.foundry.register_pipeline_connector(connector);

    assert!(rig.foundry.weld(1, &tuple(53), None).is_empty());
    let udp = SessionTuple {
        protocol: Protocol::Udp,
        ..tuple(53)
    };
    assert_eq!(rig.foundry.weld(2, &udp, None).len(), 1);
}

// ============ End-to-end Weld Tests ============

#[test]
fn test_web_filter_before_virus_scan() {
    let rig = Rig::new();
    let casing = rig.node("http-casing", None, NodeState::Running);
    let web = rig.node("web-filter", Some(1), NodeState::Running);
    let virus = rig.node("virus-scan", None, NodeState::Running);

    let inside = rig.connector("http-inside", &casing, Fitting::HttpStream, Fitting::HttpTokens);
    let outside = rig
        .foundry
        .connector("http-outside", Arc::clone(&casing) as Arc<dyn Node>)
        .fittings(Fitting::HttpTokens, Fitting::HttpStream)
        .affinity(Affinity::Server)
        .build();
    let virus_scan = rig
        .foundry
        .connector("virus-scan", virus as Arc<dyn Node>)
        .fittings(Fitting::HttpTokens, Fitting::HttpTokens)
        .strength(1)
        .build();
    let web_filter = rig.connector("web-filter", &web, Fitting::HttpTokens, Fitting::HttpTokens);

    // Registration order must not matter
    rig.foundry.register_pipeline_connector(virus_scan);
    rig.foundry.register_casing(inside, outside);
    rig.foundry.register_pipeline_connector(web_filter);

    let chain = rig.foundry.weld(1, &tuple(80), Some(2));
    assert_eq!(
        names(&chain),
        vec!["http-inside", "web-filter", "virus-scan", "http-outside"]
    );
}
