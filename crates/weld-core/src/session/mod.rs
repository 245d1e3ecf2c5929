//! Live sessions
//!
//! A [`Session`] is one stage's view of a connection. Handlers react to
//! events on it and queue outbound operations toward either side; the
//! pipeline drains the queue after each handler call.

mod request;
mod stats;

pub use request::{Attachment, NewSessionRequest, RequestState, SessionRequest};
pub use stats::{SessionStats, StatsSnapshot, TimePoint};
pub(crate) use stats::Timeline;

use crate::policy::PolicyId;
use crate::tuple::{Protocol, SessionTuple, Side};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use tracing::debug;

/// Transport-assigned session id
pub type SessionId = u64;

/// Routing state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Events go to the node's listener
    Active,
    /// Events go to the pass-through handler; terminal events still reach
    /// the listener if it asked for finalization
    Released {
        /// Listener still wants the finalization callback
        needs_finalization: bool,
    },
    /// Finalization delivered, session gone
    Finalized,
}

impl SessionState {
    /// Lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Active => "active",
            SessionState::Released { .. } => "released",
            SessionState::Finalized => "finalized",
        }
    }
}

/// Operation a handler queued toward one side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundOp {
    /// Payload to write
    Data(Bytes),
    /// Half-close
    Shutdown,
    /// Abort the connection
    Reset,
    /// UDP idle expiry
    Expire,
}

/// Queued operation with its direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// Side the operation travels toward
    pub toward: Side,
    /// What to do
    pub op: OutboundOp,
}

/// One stage's session
pub struct Session {
    id: SessionId,
    tuple: SessionTuple,
    policy_id: Option<PolicyId>,
    node: String,
    max_chunk: usize,
    state: Mutex<SessionState>,
    attachment: RwLock<Option<Attachment>>,
    outbox: Mutex<Vec<Outbound>>,
    stats: SessionStats,
}

impl Session {
    pub(crate) fn new(
        request: &NewSessionRequest,
        node: &str,
        max_chunk: usize,
        detailed_times: bool,
    ) -> Self {
        Self {
            id: request.id(),
            tuple: request.tuple(),
            policy_id: request.policy_id(),
            node: node.to_string(),
            max_chunk,
            state: Mutex::new(SessionState::Active),
            attachment: RwLock::new(None),
            outbox: Mutex::new(Vec::new()),
            stats: SessionStats::new(detailed_times),
        }
    }

    /// Session id
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Tuple as seen by this stage
    pub fn tuple(&self) -> SessionTuple {
        self.tuple
    }

    /// Transport protocol
    pub fn protocol(&self) -> Protocol {
        self.tuple.protocol
    }

    /// Policy rack
    pub fn policy_id(&self) -> Option<PolicyId> {
        self.policy_id
    }

    /// Name of the owning node
    pub fn node_name(&self) -> &str {
        &self.node
    }

    /// Current routing state
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Stats of this stage
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Queue payload toward `toward`
    ///
    /// TCP payload larger than the read buffer is split into buffer-sized
    /// chunks. UDP packets are never split; one larger than the maximum
    /// packet size is dropped and counted.
    pub fn send(&self, toward: Side, mut data: Bytes) {
        if data.is_empty() {
            return;
        }
        if self.tuple.protocol == Protocol::Udp && self.max_chunk > 0 && data.len() > self.max_chunk {
            debug!(
                session_id = self.id,
                node = %self.node,
                size = data.len(),
                max = self.max_chunk,
                "Dropping oversize UDP packet"
            );
            self.stats.record_dropped_packet();
            return;
        }
        let mut outbox = self.outbox.lock();
        if self.tuple.protocol == Protocol::Tcp && self.max_chunk > 0 {
            while data.len() > self.max_chunk {
                let head = data.split_to(self.max_chunk);
                outbox.push(Outbound {
                    toward,
                    op: OutboundOp::Data(head),
                });
            }
        }
        outbox.push(Outbound {
            toward,
            op: OutboundOp::Data(data),
        });
    }

    /// Queue a half-close toward `toward`
    pub fn shutdown(&self, toward: Side) {
        self.push(toward, OutboundOp::Shutdown);
    }

    /// Queue a reset toward `toward`
    pub fn reset(&self, toward: Side) {
        self.push(toward, OutboundOp::Reset);
    }

    /// Queue an expiry toward `toward`
    pub fn expire(&self, toward: Side) {
        self.push(toward, OutboundOp::Expire);
    }

    fn push(&self, toward: Side, op: OutboundOp) {
        self.outbox.lock().push(Outbound { toward, op });
    }

    /// Take every queued operation, oldest first
    pub fn drain_outbox(&self) -> Vec<Outbound> {
        std::mem::take(&mut *self.outbox.lock())
    }

    /// Stop inspecting; later events go to the pass-through handler
    ///
    /// Release is one-way. Releasing again can only add the finalization
    /// request, never withdraw it.
    pub fn release(&self, needs_finalization: bool) {
        let mut state = self.state.lock();
        *state = match *state {
            SessionState::Active => SessionState::Released { needs_finalization },
            SessionState::Released {
                needs_finalization: previous,
            } => SessionState::Released {
                needs_finalization: previous || needs_finalization,
            },
            SessionState::Finalized => SessionState::Finalized,
        };
    }

    /// Whether the session was released
    pub fn released(&self) -> bool {
        !matches!(self.state(), SessionState::Active)
    }

    /// Whether the listener still gets terminal events
    pub fn needs_finalization(&self) -> bool {
        match self.state() {
            SessionState::Active => true,
            SessionState::Released { needs_finalization } => needs_finalization,
            SessionState::Finalized => false,
        }
    }

    pub(crate) fn mark_finalized(&self) {
        *self.state.lock() = SessionState::Finalized;
    }

    /// Whether finalization has been delivered
    pub fn is_finalized(&self) -> bool {
        self.state() == SessionState::Finalized
    }

    /// Replace the attachment, returning the previous one
    pub fn attach(&self, value: Attachment) -> Option<Attachment> {
        self.attachment.write().replace(value)
    }

    /// Current attachment
    pub fn attachment(&self) -> Option<Attachment> {
        self.attachment.read().clone()
    }

    /// Admin descriptor
    pub fn desc(&self) -> SessionDesc {
        SessionDesc {
            id: self.id,
            node: self.node.clone(),
            protocol: self.tuple.protocol,
            client: self.tuple.client(),
            server: self.tuple.server(),
            policy: self.policy_id,
            state: self.state().as_str(),
            stats: self.stats.snapshot(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("tuple", &self.tuple)
            .field("policy_id", &self.policy_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Serializable session description for monitoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionDesc {
    /// Session id
    pub id: SessionId,
    /// Owning node
    pub node: String,
    /// Transport protocol
    pub protocol: Protocol,
    /// Client endpoint
    pub client: SocketAddr,
    /// Server endpoint
    pub server: SocketAddr,
    /// Policy rack
    pub policy: Option<PolicyId>,
    /// Routing state name
    pub state: &'static str,
    /// Counters
    pub stats: StatsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(protocol: Protocol, max_chunk: usize) -> Session {
        let request = SessionRequest::new(
            1,
            SessionTuple::new(
                protocol,
                "192.168.1.10:40000".parse().unwrap(),
                "93.184.216.34:80".parse().unwrap(),
            ),
            Some(1),
        );
        Session::new(&NewSessionRequest::new(&request), "web-filter", max_chunk, false)
    }

    #[test]
    fn test_release_is_monotonic() {
        let s = session(Protocol::Tcp, 0);
        assert!(!s.released());
        assert!(s.needs_finalization());

        s.release(true);
        assert!(s.released());
        assert!(s.needs_finalization());

        s.release(false);
        assert!(s.needs_finalization(), "finalization request is kept");

        s.mark_finalized();
        s.release(true);
        assert!(s.is_finalized());
        assert!(!s.needs_finalization());
    }

    #[test]
    fn test_outbox_order() {
        let s = session(Protocol::Tcp, 0);
        s.send(Side::Server, Bytes::from_static(b"GET /"));
        s.send(Side::Server, Bytes::new());
        s.shutdown(Side::Server);
        s.reset(Side::Client);

        let ops = s.drain_outbox();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].op, OutboundOp::Data(Bytes::from_static(b"GET /")));
        assert_eq!(ops[1].op, OutboundOp::Shutdown);
        assert_eq!(ops[2].toward, Side::Client);
        assert!(s.drain_outbox().is_empty());
    }

    #[test]
    fn test_tcp_send_splits_to_buffer_size() {
        let s = session(Protocol::Tcp, 4);
        s.send(Side::Client, Bytes::from_static(b"0123456789"));
        let sizes: Vec<usize> = s
            .drain_outbox()
            .into_iter()
            .map(|o| match o.op {
                OutboundOp::Data(d) => d.len(),
                _ => 0,
            })
            .collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn test_udp_send_keeps_packets_whole() {
        let s = session(Protocol::Udp, 16);
        s.send(Side::Client, Bytes::from_static(b"0123456789"));
        assert_eq!(
            s.drain_outbox(),
            vec![Outbound {
                toward: Side::Client,
                op: OutboundOp::Data(Bytes::from_static(b"0123456789")),
            }]
        );
        assert_eq!(s.stats().snapshot().dropped_packets, 0);
    }

    #[test]
    fn test_udp_send_drops_oversize_packet() {
        let s = session(Protocol::Udp, 4);
        s.send(Side::Client, Bytes::from_static(b"0123456789"));
        s.send(Side::Server, Bytes::from_static(b"dns"));
        assert_eq!(
            s.drain_outbox(),
            vec![Outbound {
                toward: Side::Server,
                op: OutboundOp::Data(Bytes::from_static(b"dns")),
            }]
        );
        assert_eq!(s.stats().snapshot().dropped_packets, 1);
    }

    #[test]
    fn test_desc_serializes() {
        let s = session(Protocol::Tcp, 0);
        s.stats().record_chunk(Side::Client, 12);
        let json = serde_json::to_value(s.desc()).unwrap();
        assert_eq!(json["node"], "web-filter");
        assert_eq!(json["protocol"], "tcp");
        assert_eq!(json["server"], "93.184.216.34:80");
        assert_eq!(json["state"], "active");
        assert_eq!(json["stats"]["c2s_bytes"], 12);
    }
}
