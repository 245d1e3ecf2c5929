//! Dispatcher counters
//!
//! Live counters go up and down with the live-session table. Lifetime
//! counters only ever go up.

use crate::tuple::Protocol;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// One named node metric
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeMetric {
    /// Stable metric name
    pub name: &'static str,
    /// Human readable name
    pub display_name: &'static str,
    /// Current value
    pub value: u64,
}

/// Session counters of one dispatcher
#[derive(Debug, Default)]
pub struct DispatcherStats {
    live_sessions: AtomicU64,
    tcp_live_sessions: AtomicU64,
    udp_live_sessions: AtomicU64,
    sessions: AtomicU64,
    tcp_sessions: AtomicU64,
    udp_sessions: AtomicU64,
    session_requests: AtomicU64,
    tcp_session_requests: AtomicU64,
    udp_session_requests: AtomicU64,
}

impl DispatcherStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// A new-session request arrived
    pub fn session_request(&self, protocol: Protocol) {
        self.session_requests.fetch_add(1, Ordering::Relaxed);
        match protocol {
            Protocol::Tcp => self.tcp_session_requests.fetch_add(1, Ordering::Relaxed),
            Protocol::Udp => self.udp_session_requests.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// A session entered the live table
    pub fn session_added(&self, protocol: Protocol) {
        self.live_sessions.fetch_add(1, Ordering::Relaxed);
        self.sessions.fetch_add(1, Ordering::Relaxed);
        match protocol {
            Protocol::Tcp => {
                self.tcp_live_sessions.fetch_add(1, Ordering::Relaxed);
                self.tcp_sessions.fetch_add(1, Ordering::Relaxed);
            }
            Protocol::Udp => {
                self.udp_live_sessions.fetch_add(1, Ordering::Relaxed);
                self.udp_sessions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// A session left the live table
    pub fn session_removed(&self, protocol: Protocol) {
        decrement(&self.live_sessions);
        match protocol {
            Protocol::Tcp => decrement(&self.tcp_live_sessions),
            Protocol::Udp => decrement(&self.udp_live_sessions),
        }
    }

    /// Current live sessions
    pub fn live_sessions(&self) -> u64 {
        self.live_sessions.load(Ordering::Relaxed)
    }

    /// Lifetime sessions
    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    /// Lifetime requests
    pub fn session_requests(&self) -> u64 {
        self.session_requests.load(Ordering::Relaxed)
    }

    /// All nine metrics with display names
    pub fn metrics(&self) -> Vec<NodeMetric> {
        let metric = |name, display_name, counter: &AtomicU64| NodeMetric {
            name,
            display_name,
            value: counter.load(Ordering::Relaxed),
        };
        vec![
            metric("live-sessions", "Current Sessions", &self.live_sessions),
            metric("tcp-live-sessions", "Current TCP Sessions", &self.tcp_live_sessions),
            metric("udp-live-sessions", "Current UDP Sessions", &self.udp_live_sessions),
            metric("sessions", "Sessions", &self.sessions),
            metric("tcp-sessions", "TCP Sessions", &self.tcp_sessions),
            metric("udp-sessions", "UDP Sessions", &self.udp_sessions),
            metric("session-requests", "Session Requests", &self.session_requests),
            metric("tcp-session-requests", "TCP Session Requests", &self.tcp_session_requests),
            metric("udp-session-requests", "UDP Session Requests", &self.udp_session_requests),
        ]
    }
}

fn decrement(counter: &AtomicU64) {
    // Saturate at zero rather than wrap
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}
