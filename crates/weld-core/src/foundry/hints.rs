//! Fitting hints
//!
//! A casing that knows a future connection's protocol (an FTP data
//! channel announced on the control channel) leaves a one-shot hint keyed
//! by the server endpoint. The next session to that endpoint consumes it.

use crate::fitting::Fitting;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy)]
struct Hint {
    fitting: Fitting,
    created: Instant,
}

/// One-shot fitting overrides keyed by server endpoint
#[derive(Debug)]
pub struct FittingHints {
    hints: DashMap<SocketAddr, Hint>,
    timeout: Option<Duration>,
}

impl Default for FittingHints {
    fn default() -> Self {
        Self::new(None)
    }
}

impl FittingHints {
    /// Create an empty table; hints older than `timeout` are ignored
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            hints: DashMap::new(),
            timeout: timeout.filter(|t| !t.is_zero()),
        }
    }

    /// Register a hint, replacing any previous one for the endpoint
    pub fn add(&self, server: SocketAddr, fitting: Fitting) {
        debug!(%server, %fitting, "Adding fitting hint");
        self.hints.insert(
            server,
            Hint {
                fitting,
                created: Instant::now(),
            },
        );
    }

    /// Consume the hint for `server`, if a fresh one exists
    pub fn take(&self, server: &SocketAddr) -> Option<Fitting> {
        let (_, hint) = self.hints.remove(server)?;
        if self.is_expired(&hint) {
            trace!(%server, fitting = %hint.fitting, "Dropping expired fitting hint");
            return None;
        }
        Some(hint.fitting)
    }

    fn is_expired(&self, hint: &Hint) -> bool {
        self.timeout.is_some_and(|timeout| hint.created.elapsed() > timeout)
    }

    /// Drop expired hints
    pub fn cleanup(&self) {
        let before = self.hints.len();
        self.hints.retain(|_, hint| !self.is_expired(hint));
        let removed = before.saturating_sub(self.hints.len());
        if removed > 0 {
            debug!(removed, "Cleaned up expired fitting hints");
        }
    }

    /// Number of pending hints
    pub fn len(&self) -> usize {
        self.hints.len()
    }

    /// Check if no hints are pending
    pub fn is_empty(&self) -> bool {
        self.hints.is_empty()
    }

    /// Drop all hints
    pub fn clear(&self) {
        self.hints.clear();
    }
}
