//! New session requests
//!
//! A [`SessionRequest`] is what the transport hands in. Each dispatcher
//! wraps it in a [`NewSessionRequest`] its listener may reject, release,
//! redirect or annotate before any session object exists.

use super::SessionId;
use crate::policy::PolicyId;
use crate::tuple::{Protocol, SessionTuple};
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Opaque value a listener carries from the request onto the session
pub type Attachment = Arc<dyn Any + Send + Sync>;

/// Raw new-session request from the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRequest {
    /// Transport-assigned session id
    pub id: SessionId,
    /// Connection identity
    pub tuple: SessionTuple,
    /// Policy rack the session belongs to
    pub policy_id: Option<PolicyId>,
}

impl SessionRequest {
    /// Create a request
    pub fn new(id: SessionId, tuple: SessionTuple, policy_id: Option<PolicyId>) -> Self {
        Self { id, tuple, policy_id }
    }

    /// Log context name, `NT<id>` for TCP and `NU<id>` for UDP
    pub fn log_name(&self) -> String {
        match self.tuple.protocol {
            Protocol::Tcp => format!("NT{}", self.id),
            Protocol::Udp => format!("NU{}", self.id),
        }
    }
}

/// Outcome of a listener's new-session-request handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// No decision yet; the session will be created
    Requested,
    /// Accepted with an explicit endpoint decision
    Endpointed,
    /// Refused, the client is told
    Rejected,
    /// Refused without notifying the client
    RejectedSilent,
    /// Let through without inspection
    Released,
}

impl RequestState {
    /// Whether the request was refused
    pub fn is_rejected(self) -> bool {
        matches!(self, RequestState::Rejected | RequestState::RejectedSilent)
    }

    /// Whether a decision other than "go ahead" was made
    pub fn is_final(self) -> bool {
        matches!(
            self,
            RequestState::Rejected | RequestState::RejectedSilent | RequestState::Released
        )
    }

    /// Lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            RequestState::Requested => "requested",
            RequestState::Endpointed => "endpointed",
            RequestState::Rejected => "rejected",
            RequestState::RejectedSilent => "rejected_silent",
            RequestState::Released => "released",
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request wrapper offered to a listener
///
/// Reject, silent reject and release are final: once one is made, later
/// decisions are ignored.
pub struct NewSessionRequest {
    id: SessionId,
    original: SessionTuple,
    tuple: SessionTuple,
    policy_id: Option<PolicyId>,
    state: RequestState,
    needs_finalization: bool,
    modified: bool,
    attachment: Option<Attachment>,
}

impl NewSessionRequest {
    /// Wrap a transport request
    pub fn new(request: &SessionRequest) -> Self {
        Self {
            id: request.id,
            original: request.tuple,
            tuple: request.tuple,
            policy_id: request.policy_id,
            state: RequestState::Requested,
            needs_finalization: false,
            modified: false,
            attachment: None,
        }
    }

    /// Session id
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Tuple as requested by the transport
    pub fn original_tuple(&self) -> SessionTuple {
        self.original
    }

    /// Tuple after any modification
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

    /// Current decision
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Whether a finalization callback is wanted even if not inspected
    pub fn needs_finalization(&self) -> bool {
        self.needs_finalization
    }

    /// Whether an endpoint was changed
    pub fn modified(&self) -> bool {
        self.modified
    }

    fn decide(&mut self, state: RequestState) {
        if !self.state.is_final() {
            self.state = state;
        }
    }

    /// Refuse the session
    pub fn reject(&mut self) {
        self.decide(RequestState::Rejected);
    }

    /// Refuse the session without notifying the client
    pub fn reject_silently(&mut self) {
        self.decide(RequestState::RejectedSilent);
    }

    /// Let the session through without inspection
    pub fn release(&mut self) {
        self.decide(RequestState::Released);
    }

    /// Accept the session explicitly
    pub fn endpoint(&mut self) {
        if self.state == RequestState::Requested {
            self.state = RequestState::Endpointed;
        }
    }

    /// Ask for a finalization callback
    pub fn set_needs_finalization(&mut self, needs_finalization: bool) {
        self.needs_finalization = needs_finalization;
    }

    /// Redirect the server side
    pub fn set_server(&mut self, server: SocketAddr) {
        self.tuple = self.tuple.with_server(server);
        self.modified = self.tuple != self.original;
    }

    /// Rewrite the client side
    pub fn set_client(&mut self, client: SocketAddr) {
        self.tuple = self.tuple.with_client(client);
        self.modified = self.tuple != self.original;
    }

    /// Attach a value carried onto the session, returning the previous one
    pub fn attach(&mut self, value: Attachment) -> Option<Attachment> {
        self.attachment.replace(value)
    }

    /// Current attachment
    pub fn attachment(&self) -> Option<&Attachment> {
        self.attachment.as_ref()
    }

    pub(crate) fn take_attachment(&mut self) -> Option<Attachment> {
        self.attachment.take()
    }
}

impl fmt::Debug for NewSessionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewSessionRequest")
            .field("id", &self.id)
            .field("tuple", &self.tuple)
            .field("policy_id", &self.policy_id)
            .field("state", &self.state)
            .field("needs_finalization", &self.needs_finalization)
            .field("modified", &self.modified)
            .field("attached", &self.attachment.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SessionRequest {
        SessionRequest::new(
            7,
            SessionTuple::new(
                Protocol::Tcp,
                "192.168.1.10:40000".parse().unwrap(),
                "93.184.216.34:80".parse().unwrap(),
            ),
            Some(1),
        )
    }

    #[test]
    fn test_log_name() {
        assert_eq!(request().log_name(), "NT7");
        let mut udp = request();
        udp.tuple.protocol = Protocol::Udp;
        assert_eq!(udp.log_name(), "NU7");
    }

    #[test]
    fn test_decisions_are_final() {
        let mut req = NewSessionRequest::new(&request());
        assert_eq!(req.state(), RequestState::Requested);

        req.endpoint();
        assert_eq!(req.state(), RequestState::Endpointed);

        req.reject_silently();
        req.release();
        req.endpoint();
        assert_eq!(req.state(), RequestState::RejectedSilent);
        assert!(req.state().is_rejected());
    }

    #[test]
    fn test_modification() {
        let mut req = NewSessionRequest::new(&request());
        assert!(!req.modified());

        req.set_server("10.0.0.1:3128".parse().unwrap());
        assert!(req.modified());
        assert_eq!(req.tuple().server_port, 3128);
        assert_eq!(req.original_tuple().server_port, 80);

        // Setting it back is not a modification
        req.set_server("93.184.216.34:80".parse().unwrap());
        assert!(!req.modified());
    }

    #[test]
    fn test_attachment() {
        let mut req = NewSessionRequest::new(&request());
        assert!(req.attach(Arc::new(42u32)).is_none());
        let value = req.attachment().and_then(|a| a.downcast_ref::<u32>().copied());
        assert_eq!(value, Some(42));
        assert!(req.take_attachment().is_some());
        assert!(req.attachment().is_none());
    }
}
