//! Engine
//!
//! Entry point for the transport layer. It welds a chain for each new
//! session, offers the request to every connector in the chain, keeps the
//! resulting pipelines and feeds them transport events until razed.

use crate::error::{Error, Result};
use crate::foundry::PipelineFoundry;
use crate::handler::SessionEvent;
use crate::pipeline::{Pipeline, Stage};
use crate::session::{RequestState, SessionId, SessionRequest};
use crate::transport::Transport;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What the transport should do with a new connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewSessionOutcome {
    /// Inspect the session through this many stages
    Accepted {
        /// Number of stages holding a session
        stages: usize,
    },
    /// No stage needs the session; the transport may bypass it
    Released,
    /// Refuse the connection
    Rejected {
        /// Do not tell the client
        silent: bool,
    },
}

/// Composition root driving welded pipelines
pub struct Engine {
    foundry: Arc<PipelineFoundry>,
    transport: Arc<dyn Transport>,
    pipelines: DashMap<SessionId, Arc<Mutex<Pipeline>>>,
}

impl Engine {
    /// Create an engine over a foundry
    pub fn new(foundry: Arc<PipelineFoundry>, transport: Arc<dyn Transport>) -> Self {
        Self {
            foundry,
            transport,
            pipelines: DashMap::new(),
        }
    }

    /// Underlying foundry
    pub fn foundry(&self) -> &Arc<PipelineFoundry> {
        &self.foundry
    }

    /// Weld and admit a new session
    ///
    /// Later stages see the tuple as modified by earlier ones. The first
    /// rejection wins; stages already created are finalized.
    #[instrument(level = "debug", skip(self, request), fields(session_id = request.id))]
    pub fn new_session_request(&self, request: SessionRequest) -> NewSessionOutcome {
        if self.pipelines.contains_key(&request.id) {
            warn!(session_id = request.id, "Session already live");
            return NewSessionOutcome::Rejected { silent: false };
        }

        let chain = self
            .foundry
            .weld(request.id, &request.tuple, request.policy_id);
        let mut stages = Vec::with_capacity(chain.len());
        let mut tuple = request.tuple;

        for connector in chain {
            let admission = connector
                .dispatcher()
                .admit(&SessionRequest::new(request.id, tuple, request.policy_id));

            if admission.failed || admission.state.is_rejected() {
                let silent = !admission.failed && admission.state == RequestState::RejectedSilent;
                if !silent {
                    info!(
                        session_id = request.id,
                        connector = %connector.name(),
                        failed = admission.failed,
                        "Session rejected"
                    );
                }
                if let Some(session) = admission.session {
                    stages.push(Stage { connector, session });
                }
                let partial = Pipeline::new(request.id, stages, Arc::clone(&self.transport));
                if let Err(e) = partial.finalize() {
                    warn!(session_id = request.id, error = %e, "Finalizing rejected session failed");
                }
                return NewSessionOutcome::Rejected { silent };
            }

            tuple = admission.tuple;
            if let Some(session) = admission.session {
                stages.push(Stage { connector, session });
            }
        }

        if stages.is_empty() {
            debug!(session_id = request.id, "Session released by every stage");
            return NewSessionOutcome::Released;
        }

        let count = stages.len();
        let pipeline = Pipeline::new(request.id, stages, Arc::clone(&self.transport));
        debug!(session_id = request.id, stages = ?pipeline.stage_names(), "Session accepted");
        self.pipelines
            .insert(request.id, Arc::new(Mutex::new(pipeline)));
        NewSessionOutcome::Accepted { stages: count }
    }

    fn pipeline(&self, session_id: SessionId) -> Result<Arc<Mutex<Pipeline>>> {
        self.pipelines
            .get(&session_id)
            .map(|p| Arc::clone(p.value()))
            .ok_or(Error::UnknownSession(session_id))
    }

    /// Feed a transport event into a session
    ///
    /// A handler error kills the session: both edges are reset and the
    /// pipeline is razed. The error is returned.
    pub fn dispatch(&self, session_id: SessionId, event: SessionEvent) -> Result<()> {
        let pipeline = self.pipeline(session_id)?;
        let result = pipeline.lock().deliver(event);

        if let Err(ref e) = result {
            warn!(session_id, kind = e.kind(), error = %e, "Killing session");
            pipeline.lock().kill();
            if let Err(raze_error) = self.raze(session_id) {
                debug!(session_id, error = %raze_error, "Raze after kill failed");
            }
        }
        result
    }

    /// Finalize and drop a session
    pub fn raze(&self, session_id: SessionId) -> Result<()> {
        let (_, pipeline) = self
            .pipelines
            .remove(&session_id)
            .ok_or(Error::UnknownSession(session_id))?;
        debug!(session_id, "Razing session");
        let result = pipeline.lock().finalize();
        result
    }

    /// Deliver a timer tick to every live session and drop stale hints
    pub fn tick(&self) {
        self.foundry.cleanup();
        for session_id in self.live_session_ids() {
            match self.dispatch(session_id, SessionEvent::Timer) {
                // Razed meanwhile
                Ok(()) | Err(Error::UnknownSession(_)) => {}
                Err(e) => debug!(session_id, error = %e, "Timer killed session"),
            }
        }
    }

    /// Raze every live session
    pub fn shutdown(&self) {
        let ids = self.live_session_ids();
        info!(sessions = ids.len(), "Razing all sessions");
        for session_id in ids {
            match self.raze(session_id) {
                Ok(()) | Err(Error::UnknownSession(_)) => {}
                Err(e) => debug!(session_id, error = %e, "Finalization failed during shutdown"),
            }
        }
    }

    /// Connector names of a live session, client side first
    pub fn pipeline_stages(&self, session_id: SessionId) -> Option<Vec<String>> {
        let pipeline = self.pipeline(session_id).ok()?;
        let names = pipeline
            .lock()
            .stage_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        Some(names)
    }

    /// Ids of live sessions, ascending
    pub fn live_session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.pipelines.iter().map(|p| *p.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.pipelines.len()
    }
}
