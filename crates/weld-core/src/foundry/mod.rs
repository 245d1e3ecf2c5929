//! Pipeline foundry
//!
//! Owns the connector registry and decides, for each new session, the
//! ordered list of connectors it traverses. Chains are memoized per
//! (policy, fitting); every registry change clears the memo.
//!
//! # Locking
//!
//! Registry changes, policy manager swaps and cache-miss computation all
//! run under the registry mutex. Cache hits only take the cache's read
//! lock, so steady-state welds never contend with each other.

pub mod cache;
pub mod chain;
pub mod hints;
pub mod registry;

pub use cache::{Chain, WeldCache};
pub use hints::FittingHints;
pub use registry::ConnectorRegistry;

use crate::config::{DispatcherConfig, FoundryConfig};
use crate::connector::{ConnectorBuilder, PipelineConnector};
use crate::fitting::Fitting;
use crate::node::{Node, NodeManager};
use crate::policy::{self, PolicyId, PolicyManager};
use crate::session::SessionId;
use crate::transport::{NullTransport, Transport};
use crate::tuple::{Protocol, SessionTuple};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Connector registry and chain welder
pub struct PipelineFoundry {
    registry: Mutex<ConnectorRegistry>,
    cache: WeldCache,
    hints: FittingHints,
    nodes: Arc<dyn NodeManager>,
    policies: RwLock<Option<Arc<dyn PolicyManager>>>,
    port_fittings: HashMap<u16, Fitting>,
    transport: Arc<dyn Transport>,
    dispatcher_config: DispatcherConfig,
}

impl PipelineFoundry {
    /// Create a foundry without a policy manager
    pub fn new(config: &FoundryConfig, nodes: Arc<dyn NodeManager>) -> Self {
        let timeout = (config.hint_timeout_secs > 0).then(|| Duration::from_secs(config.hint_timeout_secs));
        Self {
            registry: Mutex::new(ConnectorRegistry::new()),
            cache: WeldCache::new(),
            hints: FittingHints::new(timeout),
            nodes,
            policies: RwLock::new(None),
            port_fittings: config.port_table(),
            transport: Arc::new(NullTransport),
            dispatcher_config: DispatcherConfig::default(),
        }
    }

    /// Use `policies` to resolve the policy tree
    #[must_use]
    pub fn with_policy_manager(self, policies: Arc<dyn PolicyManager>) -> Self {
        *self.policies.write() = Some(policies);
        self
    }

    /// Transport handed to connectors built through [`Self::connector`]
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Dispatcher tuning handed to connectors built through [`Self::connector`]
    #[must_use]
    pub fn with_dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher_config = config;
        self
    }

    /// Start building a connector wired to this foundry's transport
    pub fn connector(&self, name: impl Into<String>, node: Arc<dyn Node>) -> ConnectorBuilder {
        PipelineConnector::builder(name, node)
            .transport(Arc::clone(&self.transport))
            .dispatcher_config(self.dispatcher_config.clone())
    }

    // ===== Registry =====

    /// Register a connector
    ///
    /// Registering the same connector twice is refused and returns `false`.
    pub fn register_pipeline_connector(&self, connector: Arc<PipelineConnector>) -> bool {
        let mut registry = self.registry.lock();
        let name = connector.name().to_string();
        if !registry.register(connector) {
            warn!(connector = %name, "Connector already registered");
            return false;
        }
        self.clear_cache_locked();
        debug!(connector = %name, total = registry.len(), "Registered connector");
        true
    }

    /// Deregister a connector; unknown connectors are ignored
    pub fn deregister_pipeline_connector(&self, connector: &Arc<PipelineConnector>) -> bool {
        let mut registry = self.registry.lock();
        if !registry.deregister(connector) {
            return false;
        }
        self.clear_cache_locked();
        debug!(connector = %connector.name(), total = registry.len(), "Deregistered connector");
        true
    }

    /// Register an inside/outside pair in one step
    pub fn register_casing(
        &self,
        inside: Arc<PipelineConnector>,
        outside: Arc<PipelineConnector>,
    ) -> bool {
        let mut registry = self.registry.lock();
        let names = format!("{}/{}", inside.name(), outside.name());
        if !registry.register_casing(inside, outside) {
            warn!(casing = %names, "Casing already registered");
            return false;
        }
        self.clear_cache_locked();
        debug!(casing = %names, total = registry.len(), "Registered casing");
        true
    }

    /// Deregister an inside/outside pair in one step
    pub fn deregister_casing(
        &self,
        inside: &Arc<PipelineConnector>,
        outside: &Arc<PipelineConnector>,
    ) -> bool {
        let mut registry = self.registry.lock();
        if !registry.deregister_casing(inside, outside) {
            return false;
        }
        self.clear_cache_locked();
        debug!(inside = %inside.name(), outside = %outside.name(), "Deregistered casing");
        true
    }

    /// Registered connectors in priority order
    pub fn connectors(&self) -> Vec<Arc<PipelineConnector>> {
        self.registry.lock().snapshot()
    }

    /// Drop every memoized chain
    pub fn clear_cache(&self) {
        let _registry = self.registry.lock();
        self.clear_cache_locked();
    }

    fn clear_cache_locked(&self) {
        debug!("Clearing weld cache");
        self.cache.clear();
    }

    /// Number of memoized chains
    pub fn cached_chains(&self) -> usize {
        self.cache.len()
    }

    // ===== Hints =====

    /// Make the next session to `server` start at `fitting`
    pub fn add_connection_fitting_hint(&self, server: SocketAddr, fitting: Fitting) {
        self.hints.add(server, fitting);
    }

    /// Drop expired fitting hints
    pub fn cleanup(&self) {
        self.hints.cleanup();
    }

    /// Number of pending fitting hints
    pub fn pending_hints(&self) -> usize {
        self.hints.len()
    }

    // ===== Policies =====

    /// Swap the policy manager; memoized chains are dropped
    pub fn set_policy_manager(&self, policies: Option<Arc<dyn PolicyManager>>) {
        let _registry = self.registry.lock();
        *self.policies.write() = policies;
        self.clear_cache_locked();
    }

    fn policy_manager(&self) -> Option<Arc<dyn PolicyManager>> {
        self.policies.read().clone()
    }

    /// Whether a node in `node_policy` handles sessions of `policy_id`
    pub fn policy_match(&self, node_policy: Option<PolicyId>, policy_id: Option<PolicyId>) -> bool {
        let policies = self.policy_manager();
        policy::policy_match(policies.as_deref(), node_policy, policy_id)
    }

    /// Generations between `child_id` and its ancestor `parent_id`, -1 if unrelated
    pub fn policy_generation_diff(&self, child_id: Option<PolicyId>, parent_id: Option<PolicyId>) -> i32 {
        let policies = self.policy_manager();
        policy::generation_diff(policies.as_deref(), child_id, parent_id)
    }

    // ===== Welding =====

    /// Starting fittings for a session, most specific first
    fn starting_fittings(&self, tuple: &SessionTuple) -> Vec<Fitting> {
        let mut fittings = Vec::with_capacity(3);
        if let Some(hint) = self.hints.take(&tuple.server()) {
            debug!(server = %tuple.server(), fitting = %hint, "Using fitting hint");
            fittings.push(hint);
        }
        if tuple.protocol == Protocol::Tcp {
            if let Some(&fitting) = self.port_fittings.get(&tuple.server_port) {
                if !fittings.contains(&fitting) {
                    fittings.push(fitting);
                }
            }
        }
        if !fittings.contains(&Fitting::OctetStream) {
            fittings.push(Fitting::OctetStream);
        }
        fittings
    }

    /// Ordered connectors a new session traverses
    #[instrument(level = "debug", skip(self, tuple), fields(tuple = %tuple))]
    pub fn weld(
        &self,
        session_id: SessionId,
        tuple: &SessionTuple,
        policy_id: Option<PolicyId>,
    ) -> Vec<Arc<PipelineConnector>> {
        let started = Instant::now();

        let mut chain = Vec::new();
        for fitting in self.starting_fittings(tuple) {
            chain.extend(self.weld_pipeline(policy_id, fitting).iter().cloned());
        }
        let welded = Instant::now();

        chain.retain(|c| c.matches(tuple));
        let filtered = Instant::now();

        debug!(
            session_id,
            policy = ?policy_id,
            nodes = ?chain.iter().map(|c| c.name()).collect::<Vec<_>>(),
            "Welded pipeline"
        );
        debug!(
            session_id,
            total_us = micros(filtered - started),
            weld_us = micros(welded - started),
            filter_us = micros(filtered - welded),
            "Weld timings"
        );
        chain
    }

    /// Memoized chain for one (policy, fitting) pair
    pub fn weld_pipeline(&self, policy_id: Option<PolicyId>, fitting: Fitting) -> Chain {
        if let Some(chain) = self.cache.lookup(policy_id, fitting) {
            return chain;
        }

        let registry = self.registry.lock();
        if let Some(chain) = self.cache.lookup(policy_id, fitting) {
            return chain;
        }

        let policies = self.policy_manager();
        let mut available = registry.snapshot();
        chain::remove_duplicates(policy_id, &mut available, self.nodes.as_ref(), policies.as_deref());
        let chain: Chain = chain::add_pipeline_connectors(&mut available, fitting, policy_id, policies.as_deref()).into();

        debug!(
            policy = ?policy_id,
            %fitting,
            connectors = chain.len(),
            "Computed pipeline"
        );
        self.cache.store(policy_id, fitting, Arc::clone(&chain));
        chain
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}
