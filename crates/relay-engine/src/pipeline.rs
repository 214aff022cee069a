//! Fan-out of producer chunks to the session's transcoders.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use relay_ipc::{Chunk, DrainReason, EngineCommand, ProcessRole, SessionId};
use relay_transcoder::{DropReason, SupervisorHandle, WriteOutcome};
use relay_transport::{ConnectionId, ProducerHandler, TransportError};

use crate::metrics::MetricsCollector;
use crate::orchestrator::Envelope;

/// Supervisor handles of one session, as seen by the pipeline.
#[derive(Clone)]
pub struct SessionTaps {
    pub session_id: SessionId,
    pub generation: u64,
    pub live: Option<SupervisorHandle>,
    pub archival: Option<SupervisorHandle>,
}

/// Where a chunk went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub live: WriteOutcome,
    pub archival: WriteOutcome,
}

/// Receives the producer connection and feeds both transcoders.
pub struct RelayPipeline {
    taps: RwLock<Option<SessionTaps>>,
    connection: Mutex<Option<(ConnectionId, u64)>>,
    metrics: Arc<MetricsCollector>,
    engine: mpsc::WeakSender<Envelope>,
}

impl RelayPipeline {
    pub(crate) fn new(metrics: Arc<MetricsCollector>, engine: mpsc::WeakSender<Envelope>) -> Self {
        Self {
            taps: RwLock::new(None),
            connection: Mutex::new(None),
            metrics,
            engine,
        }
    }

    /// Route chunks to a session's supervisors.
    pub fn attach(&self, taps: SessionTaps) {
        debug!(session_id = %taps.session_id, generation = taps.generation, "Pipeline attached");
        *self.taps.write() = Some(taps);
    }

    /// Stop routing. Chunks dispatched afterwards go nowhere.
    pub fn detach(&self) -> Option<SessionTaps> {
        self.taps.write().take()
    }

    /// Generation of the attached session.
    pub fn generation(&self) -> Option<u64> {
        self.taps.read().as_ref().map(|t| t.generation)
    }

    /// Forward a chunk to every ready supervisor, independently.
    pub fn dispatch(&self, chunk: Chunk) -> Dispatch {
        self.metrics.record_received(chunk.len());

        let taps = self.taps.read();
        let Some(taps) = taps.as_ref() else {
            trace!(sequence = chunk.sequence, "No session attached, dropping chunk");
            return Dispatch {
                live: WriteOutcome::Dropped(DropReason::Closed),
                archival: WriteOutcome::Dropped(DropReason::Closed),
            };
        };

        Dispatch {
            live: self.forward(ProcessRole::Live, taps.live.as_ref(), &chunk),
            archival: self.forward(ProcessRole::Archival, taps.archival.as_ref(), &chunk),
        }
    }

    fn forward(
        &self,
        role: ProcessRole,
        handle: Option<&SupervisorHandle>,
        chunk: &Chunk,
    ) -> WriteOutcome {
        let outcome = match handle {
            Some(handle) => handle.write(chunk.clone()),
            None => WriteOutcome::Dropped(DropReason::Closed),
        };

        match outcome {
            WriteOutcome::Queued => self.metrics.record_forwarded(role),
            WriteOutcome::Dropped(reason) => {
                trace!(%role, sequence = chunk.sequence, ?reason, "Chunk dropped");
                self.metrics.record_dropped(role);
            }
        }
        outcome
    }

    fn notify(&self, command: EngineCommand) {
        let Some(engine) = self.engine.upgrade() else {
            debug!("Engine stopped, producer notification dropped");
            return;
        };
        let envelope = Envelope {
            command,
            reply: None,
        };
        match engine.try_send(envelope) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                tokio::spawn(async move {
                    if engine.send(envelope).await.is_err() {
                        debug!("Engine stopped before producer notification");
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Engine stopped, producer notification dropped");
            }
        }
    }
}

impl ProducerHandler for RelayPipeline {
    fn on_connect(&self, connection: ConnectionId) {
        let Some(generation) = self.generation() else {
            warn!(%connection, "Producer connected without a session");
            return;
        };

        *self.connection.lock() = Some((connection, generation));
        self.notify(EngineCommand::ProducerConnected { generation });
    }

    fn on_chunk(&self, _connection: ConnectionId, chunk: Chunk) {
        self.dispatch(chunk);
    }

    fn on_disconnect(&self, connection: ConnectionId, reason: DrainReason) {
        let generation = {
            let mut current = self.connection.lock();
            match *current {
                Some((id, generation)) if id == connection => {
                    *current = None;
                    generation
                }
                _ => return,
            }
        };

        info!(%connection, generation, reason = %reason.message(), "Producer left");
        self.notify(EngineCommand::ProducerDisconnected { generation, reason });
    }

    fn on_error(&self, connection: ConnectionId, error: &TransportError) {
        warn!(%connection, "Producer connection error: {}", error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_transcoder::testing::FakeLauncher;
    use relay_transcoder::{Backoff, ProcessSupervisor, SupervisorConfig};
    use std::time::Duration;

    fn supervisor(role: ProcessRole, launcher: Arc<FakeLauncher>) -> ProcessSupervisor {
        ProcessSupervisor::spawn(
            role,
            launcher,
            SupervisorConfig::for_role(role, Backoff::immediate(), Duration::from_secs(5)),
            None,
        )
    }

    struct Fixture {
        pipeline: RelayPipeline,
        _engine: mpsc::Sender<Envelope>,
        rx: mpsc::Receiver<Envelope>,
    }

    fn pipeline() -> Fixture {
        let (tx, rx) = mpsc::channel(8);
        Fixture {
            pipeline: RelayPipeline::new(Arc::new(MetricsCollector::new()), tx.downgrade()),
            _engine: tx,
            rx,
        }
    }

    #[tokio::test]
    async fn test_dispatch_without_session_is_noop() {
        let Fixture { pipeline, .. } = pipeline();

        let dispatch = pipeline.dispatch(Chunk::new(0, &b"x"[..]));

        assert_eq!(dispatch.live, WriteOutcome::Dropped(DropReason::Closed));
        assert_eq!(dispatch.archival, WriteOutcome::Dropped(DropReason::Closed));
    }

    #[tokio::test]
    async fn test_unready_supervisor_does_not_block_the_other() {
        let Fixture { pipeline, .. } = pipeline();
        let live = FakeLauncher::new();
        let archival = FakeLauncher::new();
        archival.fail_next_launches(1);
        let live_sup = supervisor(ProcessRole::Live, live.clone());
        let archival_sup = supervisor(ProcessRole::Archival, archival.clone());

        pipeline.attach(SessionTaps {
            session_id: SessionId::new("r1").unwrap(),
            generation: 1,
            live: Some(live_sup.handle()),
            archival: Some(archival_sup.handle()),
        });

        let dispatch = pipeline.dispatch(Chunk::new(0, &b"c1"[..]));

        assert_eq!(dispatch.live, WriteOutcome::Queued);
        assert_eq!(dispatch.archival, WriteOutcome::Dropped(DropReason::NotRunning));
        assert_eq!(live.instance(0).unwrap().wait_for_bytes(2).await, b"c1");

        let metrics = pipeline.metrics.snapshot();
        assert_eq!(metrics.live.chunks_forwarded, 1);
        assert_eq!(metrics.archival.chunks_dropped, 1);
    }

    #[tokio::test]
    async fn test_detach_stops_routing() {
        let Fixture { pipeline, .. } = pipeline();
        let live = FakeLauncher::new();
        let live_sup = supervisor(ProcessRole::Live, live.clone());
        pipeline.attach(SessionTaps {
            session_id: SessionId::new("r1").unwrap(),
            generation: 1,
            live: Some(live_sup.handle()),
            archival: None,
        });

        pipeline.detach();
        pipeline.dispatch(Chunk::new(0, &b"late"[..]));
        tokio::task::yield_now().await;

        assert!(live.instance(0).unwrap().received().is_empty());
    }

    #[tokio::test]
    async fn test_connection_events_carry_generation() {
        let Fixture {
            pipeline,
            _engine,
            mut rx,
        } = pipeline();
        pipeline.attach(SessionTaps {
            session_id: SessionId::new("r1").unwrap(),
            generation: 7,
            live: None,
            archival: None,
        });

        pipeline.on_connect(ConnectionId(1));
        pipeline.on_disconnect(ConnectionId(2), DrainReason::ProducerLeft);
        pipeline.on_disconnect(ConnectionId(1), DrainReason::ProducerLeft);

        assert!(matches!(
            rx.recv().await.unwrap().command,
            EngineCommand::ProducerConnected { generation: 7 }
        ));
        assert!(matches!(
            rx.recv().await.unwrap().command,
            EngineCommand::ProducerDisconnected { generation: 7, .. }
        ));
        assert!(rx.try_recv().is_err());
    }
}
