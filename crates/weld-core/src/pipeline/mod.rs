//! Welded pipeline of one session
//!
//! Stage 0 faces the client, the last stage faces the server. An event
//! enters at the edge it came from; whatever a stage queues toward a side
//! travels to the neighbouring stage on that side, or out to the
//! transport past the edge. Work is processed in FIFO order so per-session
//! ordering holds across stages.

use crate::connector::PipelineConnector;
use crate::error::{Error, Result};
use crate::handler::SessionEvent;
use crate::session::{Outbound, OutboundOp, Session, SessionId};
use crate::transport::Transport;
use crate::tuple::Side;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{trace, warn};

/// One connector's session within a pipeline
#[derive(Debug, Clone)]
pub struct Stage {
    /// Connector of the stage
    pub connector: Arc<PipelineConnector>,
    /// The connector's session
    pub session: Arc<Session>,
}

/// Immutable chain of stages for one session
pub struct Pipeline {
    session_id: SessionId,
    stages: Vec<Stage>,
    transport: Arc<dyn Transport>,
}

impl Pipeline {
    /// Assemble a pipeline, client-facing stage first
    pub fn new(session_id: SessionId, stages: Vec<Stage>, transport: Arc<dyn Transport>) -> Self {
        Self {
            session_id,
            stages,
            transport,
        }
    }

    /// Session id
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Stages, client side first
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Number of stages
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Check if the pipeline has no stages
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Connector names, client side first
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.connector.name()).collect()
    }

    /// Deliver an event arriving from the transport
    ///
    /// Sided events enter at the edge they came from. `Timer` and
    /// `Complete` go to every stage in order.
    pub fn deliver(&self, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::Timer | SessionEvent::Complete => {
                for index in 0..self.stages.len() {
                    self.run(index, event.clone())?;
                }
                Ok(())
            }
            SessionEvent::NewSession | SessionEvent::Finalized => Err(Error::handler(
                "pipeline",
                format!("{} is not a transport event", event.name()),
            )),
            _ => {
                let Some(side) = event.side() else {
                    return Ok(());
                };
                match self.edge_stage(side) {
                    Some(index) => self.run(index, event),
                    None => {
                        // No stage: pass straight across
                        if let Some(outbound) = passthrough(event) {
                            self.transport.emit(self.session_id, outbound);
                        }
                        Ok(())
                    }
                }
            }
        }
    }

    fn edge_stage(&self, side: Side) -> Option<usize> {
        if self.stages.is_empty() {
            return None;
        }
        Some(match side {
            Side::Client => 0,
            Side::Server => self.stages.len() - 1,
        })
    }

    fn run(&self, entry: usize, event: SessionEvent) -> Result<()> {
        let mut queue = VecDeque::from([(entry, event)]);

        while let Some((index, event)) = queue.pop_front() {
            let stage = &self.stages[index];
            trace!(
                session_id = self.session_id,
                stage = index,
                connector = %stage.connector.name(),
                event = event.name(),
                "Dispatching to stage"
            );
            stage.connector.dispatcher().dispatch(&stage.session, event)?;

            for outbound in stage.session.drain_outbox() {
                let next = match outbound.toward {
                    Side::Client => index.checked_sub(1),
                    Side::Server => Some(index + 1).filter(|&i| i < self.stages.len()),
                };
                match next {
                    Some(next) => {
                        // Arriving at `next` from the side it was sent from
                        let from = outbound.toward.opposite();
                        queue.push_back((next, inbound(outbound.op, from)));
                    }
                    None => self.transport.emit(self.session_id, outbound),
                }
            }
        }
        Ok(())
    }

    /// Finalize every stage, client side first
    ///
    /// All stages are finalized even if one fails; the first error is
    /// returned. Anything queued during finalization is dropped.
    pub fn finalize(&self) -> Result<()> {
        let mut first_error = None;
        for stage in &self.stages {
            if let Err(e) = stage.connector.dispatcher().finalize(&stage.session) {
                warn!(
                    session_id = self.session_id,
                    connector = %stage.connector.name(),
                    error = %e,
                    "Finalization failed"
                );
                first_error.get_or_insert(e);
            }
            let dropped = stage.session.drain_outbox().len();
            if dropped > 0 {
                trace!(session_id = self.session_id, dropped, "Dropping output queued during finalization");
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Reset both edges
    pub fn kill(&self) {
        for side in [Side::Client, Side::Server] {
            self.transport.emit(
                self.session_id,
                Outbound {
                    toward: side,
                    op: OutboundOp::Reset,
                },
            );
        }
    }
}

/// Event seen by a stage receiving `op` from side `from`
fn inbound(op: OutboundOp, from: Side) -> SessionEvent {
    match op {
        OutboundOp::Data(data) => SessionEvent::Chunk { side: from, data },
        OutboundOp::Shutdown => SessionEvent::Fin(from),
        OutboundOp::Reset => SessionEvent::Rst(from),
        OutboundOp::Expire => SessionEvent::Expired(from),
    }
}

/// What an empty pipeline forwards for a transport event
fn passthrough(event: SessionEvent) -> Option<Outbound> {
    let (toward, op) = match event {
        SessionEvent::Chunk { side, data } => (side.opposite(), OutboundOp::Data(data)),
        SessionEvent::DataEnd {
            side,
            data: Some(data),
        } => (side.opposite(), OutboundOp::Data(data)),
        SessionEvent::Fin(side) => (side.opposite(), OutboundOp::Shutdown),
        SessionEvent::Rst(side) => (side.opposite(), OutboundOp::Reset),
        SessionEvent::Expired(side) => (side.opposite(), OutboundOp::Expire),
        _ => return None,
    };
    Some(Outbound { toward, op })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::SessionEventHandler;
    use crate::node::{Node, NodeInstance, NodeState};
    use crate::session::SessionRequest;
    use crate::transport::RecordingTransport;
    use crate::tuple::{Protocol, SessionTuple};
    use bytes::Bytes;

    /// Upper-cases client payload
    struct Shout;

    impl SessionEventHandler for Shout {
        fn handle_chunk(&self, session: &Session, side: Side, data: Bytes) -> Result<()> {
            let data = if side == Side::Client {
                Bytes::from(data.to_ascii_uppercase())
            } else {
                data
            };
            session.send(side.opposite(), data);
            Ok(())
        }
    }

    /// Answers the client itself
    struct Responder;

    impl SessionEventHandler for Responder {
        fn handle_chunk(&self, session: &Session, side: Side, _data: Bytes) -> Result<()> {
            if side == Side::Client {
                session.send(Side::Client, Bytes::from_static(b"blocked"));
                session.shutdown(Side::Client);
            }
            Ok(())
        }
    }

    fn stage(
        name: &str,
        listener: Option<Arc<dyn SessionEventHandler>>,
        request: &SessionRequest,
        transport: &Arc<RecordingTransport>,
    ) -> Stage {
        let node: Arc<dyn Node> = Arc::new(NodeInstance::new(name, None, NodeState::Running));
        let mut builder = PipelineConnector::builder(name, node).transport(transport.clone());
        if let Some(listener) = listener {
            builder = builder.listener(listener);
        }
        let connector = builder.build();
        let session = connector.dispatcher().new_session(request).unwrap();
        Stage { connector, session }
    }

    fn request() -> SessionRequest {
        SessionRequest::new(
            77,
            SessionTuple::new(
                Protocol::Tcp,
                "10.0.0.1:40000".parse().unwrap(),
                "10.0.0.2:80".parse().unwrap(),
            ),
            None,
        )
    }

    fn chunk(side: Side, data: &'static [u8]) -> SessionEvent {
        SessionEvent::Chunk {
            side,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn test_client_data_flows_through_all_stages() {
        let transport = Arc::new(RecordingTransport::new());
        let req = request();
        let pipeline = Pipeline::new(
            77,
            vec![
                stage("a", None, &req, &transport),
                stage("shout", Some(Arc::new(Shout)), &req, &transport),
                stage("c", None, &req, &transport),
            ],
            transport.clone(),
        );

        pipeline.deliver(chunk(Side::Client, b"hello")).unwrap();
        let out = transport.emitted(77);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].toward, Side::Server);
        assert_eq!(out[0].op, OutboundOp::Data(Bytes::from_static(b"HELLO")));

        // Every stage counted the chunk
        for s in pipeline.stages() {
            assert_eq!(s.session.stats().snapshot().c2s_chunks, 1);
        }
    }

    #[test]
    fn test_server_data_enters_last_stage() {
        let transport = Arc::new(RecordingTransport::new());
        let req = request();
        let pipeline = Pipeline::new(
            77,
            vec![
                stage("a", None, &req, &transport),
                stage("b", None, &req, &transport),
            ],
            transport.clone(),
        );

        pipeline.deliver(chunk(Side::Server, b"200 OK")).unwrap();
        pipeline.deliver(SessionEvent::Fin(Side::Server)).unwrap();

        let out = transport.emitted(77);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|o| o.toward == Side::Client));
        assert_eq!(out[1].op, OutboundOp::Shutdown);
        assert_eq!(pipeline.stages()[1].session.stats().snapshot().s2c_bytes, 6);
    }

    #[test]
    fn test_stage_can_answer_client() {
        let transport = Arc::new(RecordingTransport::new());
        let req = request();
        let pipeline = Pipeline::new(
            77,
            vec![
                stage("a", None, &req, &transport),
                stage("responder", Some(Arc::new(Responder)), &req, &transport),
                stage("c", None, &req, &transport),
            ],
            transport.clone(),
        );

        pipeline.deliver(chunk(Side::Client, b"GET /bad")).unwrap();
        let out = transport.emitted(77);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].toward, Side::Client);
        assert_eq!(out[0].op, OutboundOp::Data(Bytes::from_static(b"blocked")));
        assert_eq!(out[1].op, OutboundOp::Shutdown);
        // The server-facing stage never saw the request
        assert_eq!(pipeline.stages()[2].session.stats().snapshot().c2s_chunks, 0);
    }

    #[test]
    fn test_empty_pipeline_passes_across() {
        let transport = Arc::new(RecordingTransport::new());
        let pipeline = Pipeline::new(1, Vec::new(), transport.clone());
        pipeline.deliver(chunk(Side::Client, b"x")).unwrap();
        pipeline.deliver(SessionEvent::Rst(Side::Server)).unwrap();
        pipeline.deliver(SessionEvent::Timer).unwrap();

        let out = transport.emitted(1);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].toward, Side::Server);
        assert_eq!(out[1].toward, Side::Client);
        assert_eq!(out[1].op, OutboundOp::Reset);
    }

    #[test]
    fn test_finalize_and_kill() {
        let transport = Arc::new(RecordingTransport::new());
        let req = request();
        let pipeline = Pipeline::new(
            77,
            vec![
                stage("a", None, &req, &transport),
                stage("b", None, &req, &transport),
            ],
            transport.clone(),
        );

        pipeline.kill();
        pipeline.finalize().unwrap();
        assert_eq!(transport.emitted(77).len(), 2);
        assert_eq!(transport.released(77), vec!["a".to_string(), "b".to_string()]);
        assert!(pipeline.stages().iter().all(|s| s.session.is_finalized()));
    }

    #[test]
    fn test_finalized_is_not_a_transport_event() {
        let pipeline = Pipeline::new(1, Vec::new(), Arc::new(RecordingTransport::new()));
        assert!(pipeline.deliver(SessionEvent::Finalized).is_err());
    }
}
