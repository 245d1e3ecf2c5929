//! Session dispatcher
//!
//! One dispatcher per connector. It turns a transport request into a
//! session (or into nothing), routes every later event of that session to
//! either the node's listener or the pass-through handler, and keeps the
//! live-session table and counters.
//!
//! Routing rule: without a listener, or once the session is released, an
//! event goes to the pass-through handler. A released session that still
//! needs finalization keeps receiving terminal events on the listener.

mod stats;

pub use stats::{DispatcherStats, NodeMetric};

use crate::config::DispatcherConfig;
use crate::error::{Error, Result};
use crate::handler::{self, ReleasedHandler, SessionEvent, SessionEventHandler};
use crate::node::Node;
use crate::session::{
    NewSessionRequest, RequestState, Session, SessionDesc, SessionId, SessionRequest, TimePoint,
    Timeline,
};
use crate::transport::Transport;
use crate::tuple::{Protocol, SessionTuple};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn};

/// Result of offering a request to one dispatcher
#[derive(Debug, Clone)]
pub struct Admission {
    /// Listener decision
    pub state: RequestState,
    /// Tuple after any modification
    pub tuple: SessionTuple,
    /// Session, if one was created
    pub session: Option<Arc<Session>>,
    /// Construction failed; the session must be killed
    pub failed: bool,
}

/// Per-node session event router
pub struct Dispatcher {
    node: Arc<dyn Node>,
    listener: RwLock<Option<Arc<dyn SessionEventHandler>>>,
    released: Arc<dyn SessionEventHandler>,
    live: DashMap<SessionId, Arc<Session>>,
    stats: DispatcherStats,
    transport: Arc<dyn Transport>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Create a dispatcher without a listener
    pub fn new(node: Arc<dyn Node>, transport: Arc<dyn Transport>, config: DispatcherConfig) -> Self {
        Self {
            node,
            listener: RwLock::new(None),
            released: Arc::new(ReleasedHandler),
            live: DashMap::new(),
            stats: DispatcherStats::new(),
            transport,
            config,
        }
    }

    /// Owning node
    pub fn node(&self) -> &Arc<dyn Node> {
        &self.node
    }

    /// Install or remove the node's listener
    pub fn set_session_event_listener(&self, listener: Option<Arc<dyn SessionEventHandler>>) {
        *self.listener.write() = listener;
    }

    /// Whether a listener is installed
    pub fn has_listener(&self) -> bool {
        self.listener.read().is_some()
    }

    /// Create a session for a transport request
    ///
    /// Returns `None` when the request was rejected, released without
    /// needing a session, or failed.
    pub fn new_session(&self, request: &SessionRequest) -> Option<Arc<Session>> {
        self.admit(request).session
    }

    /// Offer a transport request and report the full outcome
    ///
    /// Never fails: handler errors and panics become `failed`.
    pub fn admit(&self, request: &SessionRequest) -> Admission {
        let span = info_span!(
            "new_session",
            session_id = %request.log_name(),
            protocol = %request.tuple.protocol,
            node = %self.node.name()
        );
        let _enter = span.enter();

        let mut wrapped = NewSessionRequest::new(request);
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.build_session(&mut wrapped)))
            .unwrap_or_else(|_| {
                Err(Error::HandlerPanic {
                    session_id: request.id,
                    event: "new_session_request",
                })
            });

        match result {
            Ok(session) => Admission {
                state: wrapped.state(),
                tuple: wrapped.tuple(),
                session,
                failed: false,
            },
            Err(e) => {
                error!(
                    session_id = request.id,
                    kind = e.kind(),
                    error = %e,
                    "Error building {} session",
                    request.tuple.protocol
                );
                Admission {
                    state: wrapped.state(),
                    tuple: wrapped.tuple(),
                    session: None,
                    failed: true,
                }
            }
        }
    }

    fn build_session(&self, request: &mut NewSessionRequest) -> Result<Option<Arc<Session>>> {
        let protocol = request.protocol();
        let mut timeline = Timeline::start();
        self.stats.session_request(protocol);

        timeline.mark(TimePoint::DispatchRequest);
        self.handler_for(true).handle_new_session_request(request)?;
        timeline.mark(TimePoint::RequestHandled);

        match request.state() {
            RequestState::Rejected | RequestState::RejectedSilent => {
                if !request.needs_finalization() {
                    if request.state() == RequestState::Rejected {
                        info!(tuple = %request.tuple(), "Rejecting session");
                    }
                    return Ok(None);
                }
                debug!("Rejecting session, keeping it for finalization");
            }
            RequestState::Released => {
                if !request.needs_finalization() && !request.modified() {
                    debug!("Releasing session");
                    return Ok(None);
                }
                debug!(
                    needs_finalization = request.needs_finalization(),
                    modified = request.modified(),
                    "Releasing session as pass-through"
                );
            }
            RequestState::Requested | RequestState::Endpointed => {}
        }

        let max_chunk = match protocol {
            Protocol::Tcp => self.config.tcp_read_buffer_size,
            Protocol::Udp => self.config.udp_max_packet_size,
        };
        let session = Arc::new(Session::new(
            request,
            self.node.name(),
            max_chunk,
            self.config.detailed_times,
        ));
        if let Some(attachment) = request.take_attachment() {
            session.attach(attachment);
        }
        timeline.mark(TimePoint::MadeSession);

        // A rejected request kept for finalization still sees the new session
        if request.state() == RequestState::Released {
            session.release(request.needs_finalization());
        } else {
            info!(tuple = %session.tuple(), "New {} session", protocol);
            timeline.mark(TimePoint::DispatchNew);
            self.dispatch(&session, SessionEvent::NewSession)?;
            timeline.mark(TimePoint::NewHandled);
        }

        self.add_session(&session)?;
        timeline.mark(TimePoint::FinishNew);
        session.stats().adopt(&timeline);

        Ok(Some(session))
    }

    /// Route one event of a live session
    pub fn dispatch(&self, session: &Session, event: SessionEvent) -> Result<()> {
        if self.config.event_log {
            self.elog(session.id(), &event);
        }
        match event {
            SessionEvent::Chunk { side, ref data } => session.stats().record_chunk(side, data.len()),
            SessionEvent::DataEnd {
                side,
                data: Some(ref data),
            } => session.stats().record_chunk(side, data.len()),
            _ => {}
        }

        let handler = self.handler_for(
            !session.released() || (event.is_terminal() && session.needs_finalization()),
        );
        let name = event.name();

        panic::catch_unwind(AssertUnwindSafe(|| {
            handler::deliver(handler.as_ref(), session, event)
        }))
        .unwrap_or_else(|_| {
            Err(Error::HandlerPanic {
                session_id: session.id(),
                event: name,
            })
        })
    }

    /// Listener if installed and wanted, otherwise pass-through
    fn handler_for(&self, wants_listener: bool) -> Arc<dyn SessionEventHandler> {
        if wants_listener {
            if let Some(listener) = self.listener.read().as_ref() {
                return Arc::clone(listener);
            }
        }
        Arc::clone(&self.released)
    }

    fn elog(&self, session_id: SessionId, event: &SessionEvent) {
        let thread = std::thread::current();
        debug!(
            target: "weld::events",
            session_id,
            node = %self.node.name(),
            event = event.name(),
            size = ?event.size(),
            thread = thread.name().unwrap_or("unnamed"),
        );
    }

    /// Deliver finalization and remove the session
    ///
    /// The session is removed even if the handler fails.
    pub fn finalize(&self, session: &Session) -> Result<()> {
        let result = self.dispatch(session, SessionEvent::Finalized);
        session.mark_finalized();
        self.remove_session(session.id());
        result
    }

    fn add_session(&self, session: &Arc<Session>) -> Result<()> {
        match self.live.entry(session.id()) {
            Entry::Occupied(_) => Err(Error::DuplicateSession(session.id())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(session));
                self.stats.session_added(session.protocol());
                Ok(())
            }
        }
    }

    /// Drop a session from the live table and tell the transport
    ///
    /// Counters only move if the session was actually live.
    pub fn remove_session(&self, session_id: SessionId) -> Option<Arc<Session>> {
        let Some((_, session)) = self.live.remove(&session_id) else {
            warn!(
                session_id,
                node = %self.node.name(),
                "Attempt to remove session that is not live"
            );
            return None;
        };
        self.stats.session_removed(session.protocol());
        self.transport.release_session(session_id, self.node.name());
        debug!(session_id, node = %self.node.name(), "Removed session");
        Some(session)
    }

    /// Live session by id
    pub fn live_session(&self, session_id: SessionId) -> Option<Arc<Session>> {
        self.live.get(&session_id).map(|s| Arc::clone(s.value()))
    }

    /// Ids of all live sessions, ascending
    pub fn live_session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.live.iter().map(|s| *s.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// All live sessions
    pub fn live_sessions(&self) -> Vec<Arc<Session>> {
        self.live.iter().map(|s| Arc::clone(s.value())).collect()
    }

    /// Descriptors of all live sessions, by id
    pub fn live_session_descs(&self) -> Vec<SessionDesc> {
        let mut descs: Vec<SessionDesc> = self.live.iter().map(|s| s.value().desc()).collect();
        descs.sort_by_key(|d| d.id);
        descs
    }

    /// Number of live sessions
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Counters
    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    /// Named node metrics
    pub fn metrics(&self) -> Vec<NodeMetric> {
        self.stats.metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeInstance, NodeState};
    use crate::transport::RecordingTransport;
    use bytes::Bytes;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<&'static str>>,
    }

    impl SessionEventHandler for Recorder {
        fn handle_new_session(&self, _session: &Session) -> Result<()> {
            self.seen.lock().push("new_session");
            Ok(())
        }

        fn handle_timer(&self, _session: &Session) -> Result<()> {
            self.seen.lock().push("timer");
            Ok(())
        }

        fn handle_finalized(&self, _session: &Session) -> Result<()> {
            self.seen.lock().push("finalized");
            Ok(())
        }
    }

    struct Panicker;

    impl SessionEventHandler for Panicker {
        fn handle_new_session(&self, _session: &Session) -> Result<()> {
            panic!("listener bug");
        }
    }

    fn dispatcher(transport: Arc<RecordingTransport>) -> Dispatcher {
        let node: Arc<dyn Node> = Arc::new(NodeInstance::new("web-filter", Some(1), NodeState::Running));
        Dispatcher::new(node, transport, DispatcherConfig::default())
    }

    fn request(id: SessionId) -> SessionRequest {
        SessionRequest::new(
            id,
            SessionTuple::new(
                Protocol::Tcp,
                "192.168.1.10:40000".parse().unwrap(),
                "93.184.216.34:80".parse().unwrap(),
            ),
            Some(1),
        )
    }

    #[test]
    fn test_no_listener_accepts_and_passes_through() {
        let d = dispatcher(Arc::new(RecordingTransport::new()));
        let session = d.new_session(&request(1)).unwrap();
        assert_eq!(d.live_session_ids(), vec![1]);

        d.dispatch(
            &session,
            SessionEvent::Chunk {
                side: crate::tuple::Side::Client,
                data: Bytes::from_static(b"abc"),
            },
        )
        .unwrap();
        assert_eq!(session.drain_outbox().len(), 1);
        assert_eq!(session.stats().snapshot().c2s_bytes, 3);
    }

    #[test]
    fn test_listener_routing_and_finalize() {
        let transport = Arc::new(RecordingTransport::new());
        let d = dispatcher(Arc::clone(&transport));
        let recorder = Arc::new(Recorder::default());
        d.set_session_event_listener(Some(recorder.clone()));

        let session = d.new_session(&request(5)).unwrap();
        d.dispatch(&session, SessionEvent::Timer).unwrap();
        d.finalize(&session).unwrap();

        assert_eq!(*recorder.seen.lock(), vec!["new_session", "timer", "finalized"]);
        assert_eq!(d.live_count(), 0);
        assert!(session.is_finalized());
        assert_eq!(transport.released(5), vec!["web-filter".to_string()]);
    }

    #[test]
    fn test_released_with_finalization_skips_listener_until_terminal() {
        let d = dispatcher(Arc::new(RecordingTransport::new()));
        let recorder = Arc::new(Recorder::default());
        d.set_session_event_listener(Some(recorder.clone()));

        let session = d.new_session(&request(6)).unwrap();
        session.release(true);
        d.dispatch(&session, SessionEvent::Timer).unwrap();
        d.finalize(&session).unwrap();

        assert_eq!(*recorder.seen.lock(), vec!["new_session", "finalized"]);
    }

    #[test]
    fn test_duplicate_session_fails() {
        let d = dispatcher(Arc::new(RecordingTransport::new()));
        assert!(d.new_session(&request(9)).is_some());
        let second = d.admit(&request(9));
        assert!(second.failed);
        assert!(second.session.is_none());
        assert_eq!(d.live_count(), 1);
    }

    #[test]
    fn test_panicking_listener_kills_session() {
        let d = dispatcher(Arc::new(RecordingTransport::new()));
        d.set_session_event_listener(Some(Arc::new(Panicker)));

        let admission = d.admit(&request(10));
        assert!(admission.failed);
        assert!(admission.session.is_none());
        assert_eq!(d.live_count(), 0);
        assert_eq!(d.stats().session_requests(), 1);
    }

    #[test]
    fn test_remove_unknown_session_leaves_counters() {
        let transport = Arc::new(RecordingTransport::new());
        let d = dispatcher(Arc::clone(&transport));
        d.new_session(&request(1)).unwrap();

        assert!(d.remove_session(2).is_none());
        assert_eq!(d.stats().live_sessions(), 1);
        assert!(transport.is_empty());

        assert!(d.remove_session(1).is_some());
        assert!(d.remove_session(1).is_none());
        assert_eq!(d.stats().live_sessions(), 0);
        assert_eq!(d.stats().sessions(), 1);
    }
}
