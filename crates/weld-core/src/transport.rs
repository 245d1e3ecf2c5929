//! Transport seam
//!
//! The transport layer owns sockets and kernel state. The engine hands it
//! whatever leaves either edge of a welded chain and tells it when a
//! stage session is gone.

use crate::session::{Outbound, SessionId};
use parking_lot::Mutex;

/// Lower layer receiving chain output
pub trait Transport: Send + Sync {
    /// An operation left the chain toward `outbound.toward`
    fn emit(&self, session_id: SessionId, outbound: Outbound);

    /// A node's stage session was removed; release its resources
    fn release_session(&self, session_id: SessionId, node: &str);
}

/// Transport that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn emit(&self, _session_id: SessionId, _outbound: Outbound) {}

    fn release_session(&self, _session_id: SessionId, _node: &str) {}
}

/// Operation seen by a [`RecordingTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOp {
    /// Chain output
    Emit {
        /// Session id
        session_id: SessionId,
        /// What left the chain
        outbound: Outbound,
    },
    /// Stage session removal
    Release {
        /// Session id
        session_id: SessionId,
        /// Node whose stage was removed
        node: String,
    },
}

/// Transport that keeps every operation, for tests and simulation
#[derive(Debug, Default)]
pub struct RecordingTransport {
    ops: Mutex<Vec<TransportOp>>,
}

impl RecordingTransport {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all recorded operations
    pub fn ops(&self) -> Vec<TransportOp> {
        self.ops.lock().clone()
    }

    /// Take and clear all recorded operations
    pub fn take(&self) -> Vec<TransportOp> {
        std::mem::take(&mut *self.ops.lock())
    }

    /// Emitted operations for one session
    pub fn emitted(&self, session_id: SessionId) -> Vec<Outbound> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                TransportOp::Emit {
                    session_id: id,
                    outbound,
                } if *id == session_id => Some(outbound.clone()),
                _ => None,
            })
            .collect()
    }

    /// Nodes whose stage was released for one session, in order
    pub fn released(&self, session_id: SessionId) -> Vec<String> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                TransportOp::Release {
                    session_id: id,
                    node,
                } if *id == session_id => Some(node.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of recorded operations
    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    /// Check if nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.ops.lock().is_empty()
    }
}

impl Transport for RecordingTransport {
    fn emit(&self, session_id: SessionId, outbound: Outbound) {
        self.ops.lock().push(TransportOp::Emit {
            session_id,
            outbound,
        });
    }

    fn release_session(&self, session_id: SessionId, node: &str) {
        self.ops.lock().push(TransportOp::Release {
            session_id,
            node: node.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::OutboundOp;
    use crate::tuple::Side;
    use bytes::Bytes;

    #[test]
    fn test_recording_transport() {
        let transport = RecordingTransport::new();
        assert!(transport.is_empty());

        transport.emit(
            1,
            Outbound {
                toward: Side::Server,
                op: OutboundOp::Data(Bytes::from_static(b"hi")),
            },
        );
        transport.emit(
            2,
            Outbound {
                toward: Side::Client,
                op: OutboundOp::Reset,
            },
        );
        transport.release_session(1, "firewall");

        assert_eq!(transport.len(), 3);
        assert_eq!(transport.emitted(1).len(), 1);
        assert_eq!(transport.emitted(2)[0].op, OutboundOp::Reset);
        assert_eq!(transport.released(1), vec!["firewall".to_string()]);

        assert_eq!(transport.take().len(), 3);
        assert!(transport.is_empty());
    }
}
