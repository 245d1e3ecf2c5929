//! Session events and the handler trait
//!
//! Every method of [`SessionEventHandler`] has a pass-through default, so
//! a node only overrides the events it inspects. [`ReleasedHandler`] is
//! the handler with nothing overridden; released sessions and nodes
//! without a listener are routed to it.

use crate::error::Result;
use crate::session::{NewSessionRequest, Session};
use crate::tuple::Side;
use bytes::Bytes;

/// Event delivered to one stage of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session was created
    NewSession,
    /// Payload arrived from `side`
    Chunk {
        /// Origin of the payload
        side: Side,
        /// Payload
        data: Bytes,
    },
    /// Stream from `side` is ending, with optional trailing payload
    DataEnd {
        /// Origin of the stream
        side: Side,
        /// Trailing payload
        data: Option<Bytes>,
    },
    /// `side` half-closed
    Fin(Side),
    /// `side` reset the connection
    Rst(Side),
    /// `side` can accept more data
    Writable(Side),
    /// UDP idle expiry from `side`
    Expired(Side),
    /// Periodic timer
    Timer,
    /// Both sides are done
    Complete,
    /// Last callback; the session is about to be removed
    Finalized,
}

impl SessionEvent {
    /// Event name for logs
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::NewSession => "new_session",
            SessionEvent::Chunk { side: Side::Client, .. } => "client_chunk",
            SessionEvent::Chunk { side: Side::Server, .. } => "server_chunk",
            SessionEvent::DataEnd { side: Side::Client, .. } => "client_data_end",
            SessionEvent::DataEnd { side: Side::Server, .. } => "server_data_end",
            SessionEvent::Fin(Side::Client) => "client_fin",
            SessionEvent::Fin(Side::Server) => "server_fin",
            SessionEvent::Rst(Side::Client) => "client_rst",
            SessionEvent::Rst(Side::Server) => "server_rst",
            SessionEvent::Writable(Side::Client) => "client_writable",
            SessionEvent::Writable(Side::Server) => "server_writable",
            SessionEvent::Expired(Side::Client) => "client_expired",
            SessionEvent::Expired(Side::Server) => "server_expired",
            SessionEvent::Timer => "timer",
            SessionEvent::Complete => "complete",
            SessionEvent::Finalized => "finalized",
        }
    }

    /// Side the event came from, if it has one
    pub fn side(&self) -> Option<Side> {
        match self {
            SessionEvent::Chunk { side, .. } | SessionEvent::DataEnd { side, .. } => Some(*side),
            SessionEvent::Fin(side)
            | SessionEvent::Rst(side)
            | SessionEvent::Writable(side)
            | SessionEvent::Expired(side) => Some(*side),
            SessionEvent::NewSession
            | SessionEvent::Timer
            | SessionEvent::Complete
            | SessionEvent::Finalized => None,
        }
    }

    /// Payload size, if the event carries payload
    pub fn size(&self) -> Option<usize> {
        match self {
            SessionEvent::Chunk { data, .. } => Some(data.len()),
            SessionEvent::DataEnd { data, .. } => data.as_ref().map(Bytes::len),
            _ => None,
        }
    }

    /// Events a released session still owes a finalizing listener
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Complete | SessionEvent::Finalized)
    }
}

/// A node's reaction to session events
///
/// Errors returned from any method kill the session.
pub trait SessionEventHandler: Send + Sync {
    /// Handler name for error reports
    fn name(&self) -> &str {
        "handler"
    }

    /// Decide whether and how the session is created
    fn handle_new_session_request(&self, _request: &mut NewSessionRequest) -> Result<()> {
        Ok(())
    }

    /// The session was created
    fn handle_new_session(&self, _session: &Session) -> Result<()> {
        Ok(())
    }

    /// Payload arrived from `side`
    fn handle_chunk(&self, session: &Session, side: Side, data: Bytes) -> Result<()> {
        session.send(side.opposite(), data);
        Ok(())
    }

    /// Stream from `side` is ending
    fn handle_data_end(&self, session: &Session, side: Side, data: Option<Bytes>) -> Result<()> {
        if let Some(data) = data {
            session.send(side.opposite(), data);
        }
        Ok(())
    }

    /// `side` half-closed
    fn handle_fin(&self, session: &Session, side: Side) -> Result<()> {
        session.shutdown(side.opposite());
        Ok(())
    }

    /// `side` reset the connection
    fn handle_rst(&self, session: &Session, side: Side) -> Result<()> {
        session.reset(side.opposite());
        Ok(())
    }

    /// `side` can accept more data
    fn handle_writable(&self, _session: &Session, _side: Side) -> Result<()> {
        Ok(())
    }

    /// UDP idle expiry from `side`
    fn handle_expired(&self, session: &Session, side: Side) -> Result<()> {
        session.expire(side.opposite());
        Ok(())
    }

    /// Periodic timer
    fn handle_timer(&self, _session: &Session) -> Result<()> {
        Ok(())
    }

    /// Both sides are done
    fn handle_complete(&self, _session: &Session) -> Result<()> {
        Ok(())
    }

    /// Last callback before removal
    fn handle_finalized(&self, _session: &Session) -> Result<()> {
        Ok(())
    }
}

/// Pass-through handler
#[derive(Debug, Default, Clone, Copy)]
pub struct ReleasedHandler;

impl SessionEventHandler for ReleasedHandler {
    fn name(&self) -> &str {
        "released"
    }
}

/// Hand one event to the matching handler method
pub fn deliver(handler: &dyn SessionEventHandler, session: &Session, event: SessionEvent) -> Result<()> {
    match event {
        SessionEvent::NewSession => handler.handle_new_session(session),
        SessionEvent::Chunk { side, data } => handler.handle_chunk(session, side, data),
        SessionEvent::DataEnd { side, data } => handler.handle_data_end(session, side, data),
        SessionEvent::Fin(side) => handler.handle_fin(session, side),
        SessionEvent::Rst(side) => handler.handle_rst(session, side),
        SessionEvent::Writable(side) => handler.handle_writable(session, side),
        SessionEvent::Expired(side) => handler.handle_expired(session, side),
        SessionEvent::Timer => handler.handle_timer(session),
        SessionEvent::Complete => handler.handle_complete(session),
        SessionEvent::Finalized => handler.handle_finalized(session),
    }
}
