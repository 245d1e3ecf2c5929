//! Connector registry
//!
//! Registered connectors, kept sorted by (affinity, strength). The sort is
//! stable, so equal keys stay in registration order.

use crate::connector::PipelineConnector;
use std::sync::Arc;

/// Sorted list of registered connectors
#[derive(Debug, Default)]
pub struct ConnectorRegistry {
    connectors: Vec<Arc<PipelineConnector>>,
}

impl ConnectorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connector; `false` if it is already registered
    pub fn register(&mut self, connector: Arc<PipelineConnector>) -> bool {
        if self.contains(&connector) {
            return false;
        }
        self.connectors.push(connector);
        self.sort();
        true
    }

    /// Remove a connector; `false` if it was not registered
    pub fn deregister(&mut self, connector: &Arc<PipelineConnector>) -> bool {
        let before = self.connectors.len();
        self.connectors.retain(|c| !Arc::ptr_eq(c, connector));
        self.connectors.len() != before
    }

    /// Add both halves of a casing; `false` if either is already registered
    pub fn register_casing(
        &mut self,
        inside: Arc<PipelineConnector>,
        outside: Arc<PipelineConnector>,
    ) -> bool {
        if self.contains(&inside) || self.contains(&outside) || Arc::ptr_eq(&inside, &outside) {
            return false;
        }
        self.connectors.push(inside);
        self.connectors.push(outside);
        self.sort();
        true
    }

    /// Remove both halves of a casing; `false` if neither was registered
    pub fn deregister_casing(
        &mut self,
        inside: &Arc<PipelineConnector>,
        outside: &Arc<PipelineConnector>,
    ) -> bool {
        let before = self.connectors.len();
        self.connectors
            .retain(|c| !Arc::ptr_eq(c, inside) && !Arc::ptr_eq(c, outside));
        self.connectors.len() != before
    }

    /// Whether this exact connector is registered
    pub fn contains(&self, connector: &Arc<PipelineConnector>) -> bool {
        self.connectors.iter().any(|c| Arc::ptr_eq(c, connector))
    }

    /// Copy of the sorted list
    pub fn snapshot(&self) -> Vec<Arc<PipelineConnector>> {
        self.connectors.clone()
    }

    /// Iterate in priority order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<PipelineConnector>> {
        self.connectors.iter()
    }

    /// Number of registered connectors
    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    /// Check if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    fn sort(&mut self) {
        self.connectors.sort_by_key(|c| c.priority());
    }
}
