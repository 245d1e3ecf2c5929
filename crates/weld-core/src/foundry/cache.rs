//! Weld cache
//!
//! Chains depend only on (policy, fitting) and the registered connector
//! set, so they are memoized on that pair and dropped wholesale whenever
//! the registry changes.

use crate::connector::PipelineConnector;
use crate::fitting::Fitting;
use crate::policy::PolicyId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Ordered, shared chain of connectors
pub type Chain = Arc<[Arc<PipelineConnector>]>;

/// Two-level (policy, fitting) chain memo
#[derive(Debug, Default)]
pub struct WeldCache {
    entries: RwLock<HashMap<Option<PolicyId>, HashMap<Fitting, Chain>>>,
}

impl WeldCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached chain for the pair
    pub fn lookup(&self, policy_id: Option<PolicyId>, fitting: Fitting) -> Option<Chain> {
        self.entries
            .read()
            .get(&policy_id)
            .and_then(|by_fitting| by_fitting.get(&fitting))
            .cloned()
    }

    /// Remember a chain
    pub fn store(&self, policy_id: Option<PolicyId>, fitting: Fitting, chain: Chain) {
        self.entries
            .write()
            .entry(policy_id)
            .or_default()
            .insert(fitting, chain);
    }

    /// Forget everything
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of cached chains
    pub fn len(&self) -> usize {
        self.entries.read().values().map(HashMap::len).sum()
    }

    /// Check if nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
