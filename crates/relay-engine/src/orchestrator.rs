//! Session controller.
//!
//! The [`Engine`] is a single task that owns the session: it is the only
//! writer of [`SessionState`], and every transition happens inside its
//! command loop. Callers talk to it through an [`EngineHandle`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use relay_ipc::{
    DrainReason, EngineCommand, EngineReply, FinalizeReceipt, ProcessRole, RelayConfig,
    RelayEvent, RelayMetrics, SessionId, SessionState, StartupPhase, COMMAND_CHANNEL_CAPACITY,
};
use relay_transcoder::{Backoff, Completion, LauncherFactory, SupervisorConfig};
use relay_transport::{IngressGate, IngressState};

use crate::error::EngineError;
use crate::handoff::UploadHandoff;
use crate::metrics::MetricsCollector;
use crate::pipeline::RelayPipeline;
use crate::state::SessionResources;
use crate::timer::ScheduledTask;
use crate::EngineResult;

type Reply = oneshot::Sender<EngineResult<EngineReply>>;

/// A command plus the channel its answer goes to.
pub(crate) struct Envelope {
    pub(crate) command: EngineCommand,
    pub(crate) reply: Option<Reply>,
}

/// Messages the engine sends to itself from timers and background tasks.
enum Internal {
    WarmupElapsed {
        generation: u64,
    },
    HandoffFinished {
        token: u64,
        session_id: SessionId,
        result: EngineResult<String>,
        reply: Option<Reply>,
    },
}

/// The session controller.
pub struct Engine {
    config: RelayConfig,
    launchers: Arc<dyn LauncherFactory>,
    handoff: Arc<UploadHandoff>,
    pipeline: Arc<RelayPipeline>,
    gate: IngressGate,
    state: Arc<RwLock<SessionState>>,
    metrics: Arc<MetricsCollector>,
    event_tx: Sender<RelayEvent>,
    command_rx: mpsc::Receiver<Envelope>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    session: Option<SessionResources>,
    next_generation: u64,
    finalize_token: u64,
}

impl Engine {
    /// Create an engine and the handle that drives it.
    pub fn new(
        config: RelayConfig,
        launchers: Arc<dyn LauncherFactory>,
        handoff: UploadHandoff,
        event_tx: Sender<RelayEvent>,
    ) -> (Self, EngineHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(MetricsCollector::new());
        let pipeline = Arc::new(RelayPipeline::new(
            Arc::clone(&metrics),
            command_tx.downgrade(),
        ));
        let state = Arc::new(RwLock::new(SessionState::Idle));
        let gate = IngressGate::new();

        let handle = EngineHandle {
            commands: command_tx,
            state: Arc::clone(&state),
            gate: gate.clone(),
            pipeline: Arc::clone(&pipeline),
            metrics: Arc::clone(&metrics),
        };

        let engine = Self {
            config,
            launchers,
            handoff: Arc::new(handoff),
            pipeline,
            gate,
            state,
            metrics,
            event_tx,
            command_rx,
            internal_tx,
            internal_rx,
            session: None,
            next_generation: 0,
            finalize_token: 0,
        };

        (engine, handle)
    }

    /// Run the engine on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run the command loop until shutdown or until every handle is gone.
    #[instrument(name = "engine_run", skip(self))]
    pub async fn run(mut self) {
        info!("Engine starting");
        self.send_event(RelayEvent::Ready);

        let interval = self.config.timing.metrics_interval();
        let mut metrics_tick =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        metrics_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                Some(message) = self.internal_rx.recv() => self.handle_internal(message),

                envelope = self.command_rx.recv() => match envelope {
                    Some(Envelope { command, reply }) => {
                        if !self.handle_command(command, reply).await {
                            break;
                        }
                    }
                    None => {
                        info!("Command channel closed, shutting down");
                        self.teardown(DrainReason::Shutdown).await;
                        break;
                    }
                },

                _ = metrics_tick.tick() => self.emit_metrics(),
            }
        }

        info!("Engine stopped");
    }

    /// Handle a command. Returns false if the engine should stop.
    async fn handle_command(&mut self, command: EngineCommand, reply: Option<Reply>) -> bool {
        debug!(command = command.name(), "Handling command");

        let result = match command {
            EngineCommand::Start { session_id } => self.start_session(session_id).await,
            EngineCommand::ProducerConnected { generation } => self.producer_connected(generation),
            EngineCommand::ProducerDisconnected { generation, reason } => {
                self.producer_disconnected(generation, reason)
            }
            EngineCommand::Finalize { session_id } => {
                self.finalize(session_id, reply);
                return true;
            }
            EngineCommand::GetState => Ok(EngineReply::Snapshot {
                state: self.current_state(),
                metrics: self.metrics.snapshot(),
            }),
            EngineCommand::Shutdown => {
                self.teardown(DrainReason::Shutdown).await;
                self.send_event(RelayEvent::Shutdown);
                respond(reply, Ok(EngineReply::Accepted(self.current_state())));
                return false;
            }
        };

        respond(reply, result);
        true
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::WarmupElapsed { generation } => self.open_ingress(generation),
            Internal::HandoffFinished {
                token,
                session_id,
                result,
                reply,
            } => self.finish_finalize(token, session_id, result, reply),
        }
    }

    /// Spawn both transcoders and schedule the ingress to open.
    #[instrument(name = "start_session", skip(self, session_id), fields(session_id = %session_id))]
    async fn start_session(&mut self, session_id: SessionId) -> EngineResult<EngineReply> {
        if self.session.is_some() || !self.state.read().is_idle() {
            info!("Tearing down the current session first");
            self.teardown(DrainReason::Superseded).await;
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let archival_path = self.config.paths.archival_path(&session_id);
        let mut session =
            SessionResources::new(session_id.clone(), generation, archival_path.clone());

        self.set_phase(&session_id, StartupPhase::SpawnLive);
        session.spawn(
            ProcessRole::Live,
            self.launchers.live(),
            self.supervisor_config(ProcessRole::Live),
            self.event_tx.clone(),
        );

        self.set_phase(&session_id, StartupPhase::SpawnArchival);
        self.handoff.reclaim(&archival_path);
        session.spawn(
            ProcessRole::Archival,
            self.launchers.archival(&archival_path),
            self.supervisor_config(ProcessRole::Archival),
            self.event_tx.clone(),
        );

        self.set_phase(&session_id, StartupPhase::WarmUp);
        let internal = self.internal_tx.clone();
        session.set_warmup(ScheduledTask::after(
            "open_ingress",
            self.config.timing.warmup_delay(),
            async move {
                // The receiver lives as long as the engine.
                let _ = internal.send(Internal::WarmupElapsed { generation });
            },
        ));

        self.metrics.start(session.stats());
        self.pipeline.attach(session.taps());
        self.session = Some(session);

        info!(
            generation,
            path = %archival_path.display(),
            warmup = ?self.config.timing.warmup_delay(),
            "Session starting"
        );
        Ok(EngineReply::Accepted(self.current_state()))
    }

    fn open_ingress(&mut self, generation: u64) {
        let Some(session_id) = self
            .session
            .as_ref()
            .filter(|s| s.generation() == generation)
            .map(|s| s.session_id().clone())
        else {
            debug!(generation, "Warm-up of a replaced session, ignoring");
            return;
        };
        if !self.state.read().is_starting() {
            debug!(generation, "Warm-up elapsed outside startup, ignoring");
            return;
        }

        self.set_phase(&session_id, StartupPhase::OpenIngress);
        self.gate.open();
        self.transition_to(SessionState::Active {
            session_id,
            producer_connected: false,
        });
        info!(generation, "Ingress open");
    }

    fn producer_connected(&mut self, generation: u64) -> EngineResult<EngineReply> {
        let current = self.current_state();
        match (&current, self.current_generation()) {
            (
                SessionState::Active {
                    session_id,
                    producer_connected: false,
                },
                Some(active),
            ) if active == generation => {
                self.transition_to(SessionState::Active {
                    session_id: session_id.clone(),
                    producer_connected: true,
                });
                self.send_event(RelayEvent::ProducerConnected {
                    session_id: session_id.clone(),
                });
            }
            _ => debug!(generation, state = current.name(), "Ignoring producer connect"),
        }
        Ok(EngineReply::Accepted(self.current_state()))
    }

    fn producer_disconnected(
        &mut self,
        generation: u64,
        reason: DrainReason,
    ) -> EngineResult<EngineReply> {
        if self.current_generation() == Some(generation) && self.state.read().is_active() {
            self.drain(reason);
        } else {
            debug!(generation, "Ignoring disconnect of a stale producer");
        }
        Ok(EngineReply::Accepted(self.current_state()))
    }

    /// Stop feeding the transcoders and let the archival encoder flush.
    #[instrument(name = "drain", skip(self))]
    fn drain(&mut self, reason: DrainReason) {
        self.gate.close();
        self.pipeline.detach();

        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.drain();
        let session_id = session.session_id().clone();
        self.metrics.stop();

        info!(%session_id, reason = %reason.message(), "Session draining");
        self.transition_to(SessionState::Draining {
            session_id: session_id.clone(),
            reason: reason.clone(),
        });
        self.send_event(RelayEvent::ProducerDisconnected { session_id, reason });
    }

    /// Tear the current session down and wait until its processes are gone.
    async fn teardown(&mut self, reason: DrainReason) {
        self.gate.close();
        self.pipeline.detach();
        // A running upload keeps going, but no longer drives the state.
        self.finalize_token += 1;

        if let Some(session) = self.session.take() {
            if session.is_running() {
                self.transition_to(SessionState::Draining {
                    session_id: session.session_id().clone(),
                    reason,
                });
            }
            session.reap().await;
            self.metrics.stop();
        }

        if !self.state.read().is_idle() {
            self.transition_to(SessionState::Idle);
        }
    }

    /// Begin publishing a recording. The reply is sent once the upload ends.
    fn finalize(&mut self, session_id: SessionId, reply: Option<Reply>) {
        let current = self.current_state();
        let (path, completion) = match &current {
            SessionState::Idle => (self.config.paths.archival_path(&session_id), None),
            SessionState::Draining {
                session_id: draining,
                ..
            } if *draining == session_id => match &self.session {
                Some(session) => (
                    session.archival_path().to_path_buf(),
                    session.archival_completion(),
                ),
                None => (self.config.paths.archival_path(&session_id), None),
            },
            other => {
                info!(%session_id, state = other.name(), "Finalize rejected");
                respond(reply, Err(EngineError::Busy { state: other.name() }));
                return;
            }
        };

        self.finalize_token += 1;
        let token = self.finalize_token;
        self.transition_to(SessionState::Finalizing {
            session_id: session_id.clone(),
        });

        let handoff = Arc::clone(&self.handoff);
        let internal = self.internal_tx.clone();
        let wait = self.config.timing.finalize_wait();
        let span = info_span!("finalize", %session_id);
        tokio::spawn(
            async move {
                let result = publish(&handoff, &session_id, &path, completion, wait).await;
                let message = Internal::HandoffFinished {
                    token,
                    session_id,
                    result,
                    reply,
                };
                if internal.send(message).is_err() {
                    debug!("Engine stopped before the upload finished");
                }
            }
            .instrument(span),
        );
    }

    fn finish_finalize(
        &mut self,
        token: u64,
        session_id: SessionId,
        result: EngineResult<String>,
        reply: Option<Reply>,
    ) {
        match &result {
            Ok(audio_url) => {
                info!(%session_id, %audio_url, "Session finalized");
                self.send_event(RelayEvent::Finalized {
                    session_id: session_id.clone(),
                    audio_url: audio_url.clone(),
                });
            }
            Err(e) => {
                warn!(%session_id, "Finalize failed: {}", e);
                self.send_event(RelayEvent::FinalizeFailed {
                    session_id: session_id.clone(),
                    message: e.to_string(),
                });
            }
        }

        if token == self.finalize_token && self.state.read().is_finalizing() {
            if self
                .session
                .as_ref()
                .is_some_and(|s| *s.session_id() == session_id)
            {
                self.session = None;
            }
            self.transition_to(SessionState::Idle);
        }

        respond(
            reply,
            result.map(|audio_url| {
                EngineReply::Finalized(FinalizeReceipt {
                    session_id,
                    audio_url,
                })
            }),
        );
    }

    fn supervisor_config(&self, role: ProcessRole) -> SupervisorConfig {
        let transcoder = &self.config.transcoder;
        let backoff = Backoff::exponential(
            Duration::from_millis(transcoder.restart_delay_ms),
            Duration::from_millis(transcoder.max_restart_delay_ms),
        );
        SupervisorConfig::for_role(role, backoff, transcoder.drain_timeout())
    }

    fn current_state(&self) -> SessionState {
        self.state.read().clone()
    }

    fn current_generation(&self) -> Option<u64> {
        self.session.as_ref().map(SessionResources::generation)
    }

    fn emit_metrics(&self) {
        if self.session.is_some() {
            self.send_event(RelayEvent::Metrics(self.metrics.snapshot()));
        }
    }

    fn set_phase(&self, session_id: &SessionId, phase: StartupPhase) {
        self.transition_to(SessionState::Starting {
            session_id: session_id.clone(),
            phase,
        });
    }

    fn transition_to(&self, new_state: SessionState) {
        let previous = {
            let mut state = self.state.write();
            let prev = state.clone();
            *state = new_state.clone();
            prev
        };

        debug!(
            previous = %previous.name(),
            current = %new_state.name(),
            "State transition"
        );

        self.send_event(RelayEvent::StateChanged {
            previous: Box::new(previous),
            current: Box::new(new_state),
        });
    }

    fn send_event(&self, event: RelayEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("Failed to send event: {}", e);
        }
    }
}

/// Wait for the archival encoder, then hand the file off.
async fn publish(
    handoff: &UploadHandoff,
    session_id: &SessionId,
    path: &Path,
    completion: Option<Completion>,
    wait: Duration,
) -> EngineResult<String> {
    if let Some(mut completion) = completion {
        debug!("Waiting for the archival encoder");
        match tokio::time::timeout(wait, completion.wait()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(EngineError::ArchivalFailed(e)),
            Err(_) => return Err(EngineError::ArchivalTimeout(wait)),
        }
    }

    Ok(handoff.finalize(session_id, path).await?)
}

fn respond(reply: Option<Reply>, result: EngineResult<EngineReply>) {
    if let Some(reply) = reply {
        if reply.send(result).is_err() {
            debug!("Requester went away before the reply");
        }
    }
}

/// Cloneable handle to a running [`Engine`].
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Envelope>,
    state: Arc<RwLock<SessionState>>,
    gate: IngressGate,
    pipeline: Arc<RelayPipeline>,
    metrics: Arc<MetricsCollector>,
}

impl EngineHandle {
    async fn request(&self, command: EngineCommand) -> EngineResult<EngineReply> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Envelope {
                command,
                reply: Some(tx),
            })
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    /// Start a session, replacing the current one.
    pub async fn start(&self, session_id: SessionId) -> EngineResult<SessionState> {
        match self.request(EngineCommand::Start { session_id }).await? {
            EngineReply::Accepted(state) => Ok(state),
            _ => Err(EngineError::UnexpectedReply),
        }
    }

    /// Publish the recording of `session_id`.
    pub async fn finalize(&self, session_id: SessionId) -> EngineResult<FinalizeReceipt> {
        match self.request(EngineCommand::Finalize { session_id }).await? {
            EngineReply::Finalized(receipt) => Ok(receipt),
            _ => Err(EngineError::UnexpectedReply),
        }
    }

    /// State and metrics as seen by the engine task.
    pub async fn snapshot(&self) -> EngineResult<(SessionState, RelayMetrics)> {
        match self.request(EngineCommand::GetState).await? {
            EngineReply::Snapshot { state, metrics } => Ok((state, metrics)),
            _ => Err(EngineError::UnexpectedReply),
        }
    }

    /// Tear down any session and stop the engine.
    pub async fn shutdown(&self) -> EngineResult<()> {
        self.request(EngineCommand::Shutdown).await.map(|_| ())
    }

    /// Current state, without a round-trip.
    pub fn state(&self) -> SessionState {
        self.state.read().clone()
    }

    /// Current metrics, without a round-trip.
    pub fn metrics(&self) -> RelayMetrics {
        self.metrics.snapshot()
    }

    pub fn gate(&self) -> &IngressGate {
        &self.gate
    }

    pub fn pipeline(&self) -> Arc<RelayPipeline> {
        Arc::clone(&self.pipeline)
    }

    /// State for the producer WebSocket routes.
    pub fn ingress(&self) -> IngressState {
        IngressState::new(self.gate.clone(), self.pipeline())
    }
}
