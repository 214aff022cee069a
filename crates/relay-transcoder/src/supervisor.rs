//! Process supervision.
//!
//! A supervisor is a single tokio task that owns at most one running process.
//! Chunk writes, input shutdown, termination requests and process exits all
//! arrive in the same `select!` loop, exits first, so a restart is atomic with
//! respect to writes: a chunk goes to whichever instance is running when the
//! loop dequeues it, never to one that has already been reaped.
//!
//! The pipe writes themselves happen on a writer task per instance, so a
//! process that stops reading its input never holds up the loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

use relay_ipc::{Chunk, ProcessEvent, ProcessRole, RelayEvent, RoleMetrics};

use crate::error::TranscoderError;
use crate::policy::{Backoff, RestartPolicy};
use crate::process::{ProcessHandle, ProcessInput, ProcessLauncher, TerminateSignal};
use crate::{TranscoderResult, DEFAULT_DRAIN_TIMEOUT_SECS, SUPERVISOR_QUEUE_CAPACITY};

/// Observable state of the supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// A process is about to be launched.
    Starting,

    /// A process is running and accepts input.
    Running { instance: u64, pid: Option<u32> },

    /// The last process exited.
    Exited {
        instance: u64,
        code: Option<i32>,
        intentional: bool,
    },

    /// Launching failed; the supervisor has stopped.
    SpawnFailed { reason: String },
}

impl ProcessState {
    /// Returns true if a process is accepting input.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// Instance number of the running process.
    pub fn running_instance(&self) -> Option<u64> {
        match self {
            Self::Running { instance, .. } => Some(*instance),
            _ => None,
        }
    }
}

/// How a supervisor finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The process exited with code 0.
    Success,

    /// The process exited with a non-zero code or a signal.
    Failed { code: Option<i32> },

    /// The process was stopped on request.
    Terminated,

    /// No process could be launched.
    SpawnFailed { reason: String },
}

impl ExitOutcome {
    /// Convert to a result for callers that only care about success.
    pub fn into_result(self) -> TranscoderResult<()> {
        match self {
            Self::Success => Ok(()),
            Self::Failed { code } => Err(TranscoderError::ExitedWithFailure(code)),
            Self::Terminated => Err(TranscoderError::Terminated),
            Self::SpawnFailed { reason } => Err(TranscoderError::SpawnFailed(reason)),
        }
    }
}

/// Result of handing a chunk to a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Queued for the running process.
    Queued,

    /// Not forwarded.
    Dropped(DropReason),
}

/// Why a chunk was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No process is running.
    NotRunning,

    /// The supervisor queue is full.
    QueueFull,

    /// The supervisor has finished.
    Closed,
}

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// What happens when the process exits on its own.
    pub restart: RestartPolicy,

    /// Time a process gets to exit after its input closed or it was interrupted.
    pub drain_timeout: Duration,
}

impl SupervisorConfig {
    /// Defaults for a role.
    pub fn for_role(role: ProcessRole, backoff: Backoff, drain_timeout: Duration) -> Self {
        Self {
            restart: RestartPolicy::for_role(role, backoff),
            drain_timeout,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart: RestartPolicy::Never,
            drain_timeout: Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS),
        }
    }
}

/// Counters kept by a supervisor.
#[derive(Debug, Default)]
pub struct SupervisorStats {
    chunks_written: AtomicU64,
    bytes_written: AtomicU64,
    chunks_dropped: AtomicU64,
    write_failures: AtomicU64,
    restarts: AtomicU64,
}

impl SupervisorStats {
    fn record_write(&self, bytes: usize) {
        self.chunks_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_drop(&self) {
        self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    /// Chunks written to a process.
    pub fn chunks_written(&self) -> u64 {
        self.chunks_written.load(Ordering::Relaxed)
    }

    /// Bytes written to a process.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Failed writes.
    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    /// Restarts performed.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Fold into role metrics; `dispatch_drops` are drops seen by the caller.
    pub fn to_metrics(&self, chunks_forwarded: u64, dispatch_drops: u64) -> RoleMetrics {
        RoleMetrics {
            chunks_forwarded,
            chunks_dropped: dispatch_drops + self.chunks_dropped.load(Ordering::Relaxed),
            chunks_written: self.chunks_written(),
            write_failures: self.write_failures(),
            restarts: self.restarts(),
        }
    }
}

enum SupervisorCommand {
    Write(Chunk),
    EndInput,
    Terminate(TerminateSignal),
}

/// Cloneable handle used to feed and stop a supervisor.
///
/// Every method is a no-op once the supervisor has finished.
#[derive(Clone)]
pub struct SupervisorHandle {
    role: ProcessRole,
    commands: mpsc::Sender<SupervisorCommand>,
    state: watch::Receiver<ProcessState>,
}

impl SupervisorHandle {
    /// Role of the supervised process.
    pub fn role(&self) -> ProcessRole {
        self.role
    }

    /// True iff a process is running.
    pub fn is_ready(&self) -> bool {
        self.state.borrow().is_running()
    }

    /// Current state.
    pub fn state(&self) -> ProcessState {
        self.state.borrow().clone()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.clone()
    }

    /// Queue a chunk for the running process. Never blocks, never buffers
    /// for a process that is not running.
    pub fn write(&self, chunk: Chunk) -> WriteOutcome {
        if !self.is_ready() {
            return WriteOutcome::Dropped(DropReason::NotRunning);
        }
        match self.commands.try_send(SupervisorCommand::Write(chunk)) {
            Ok(()) => WriteOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => WriteOutcome::Dropped(DropReason::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => WriteOutcome::Dropped(DropReason::Closed),
        }
    }

    /// Close the process input so it can flush and exit. Disables restarts.
    pub fn end_input(&self) {
        self.send_control(SupervisorCommand::EndInput);
    }

    /// Signal the process and suppress the restart its exit would trigger.
    pub fn terminate(&self, signal: TerminateSignal) {
        self.send_control(SupervisorCommand::Terminate(signal));
    }

    fn send_control(&self, command: SupervisorCommand) {
        let commands = self.commands.clone();
        let role = self.role;
        // Control messages must not be lost to a full chunk queue.
        match commands.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(command)) => {
                tokio::spawn(async move {
                    if commands.send(command).await.is_err() {
                        debug!(%role, "Supervisor finished before control message arrived");
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(%role, "Supervisor already finished");
            }
        }
    }
}

/// Waits for a supervisor to finish.
#[derive(Clone)]
pub struct Completion {
    role: ProcessRole,
    outcome: watch::Receiver<Option<ExitOutcome>>,
}

impl Completion {
    /// Role of the supervised process.
    pub fn role(&self) -> ProcessRole {
        self.role
    }

    /// Outcome, if the supervisor has finished.
    pub fn outcome(&self) -> Option<ExitOutcome> {
        self.outcome.borrow().clone()
    }

    /// Wait until the supervisor finishes.
    pub async fn wait(&mut self) -> TranscoderResult<()> {
        match self.outcome.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().map_or(Err(TranscoderError::Lost), ExitOutcome::into_result),
            Err(_) => Err(TranscoderError::Lost),
        }
    }
}

/// Owner of one supervised process.
///
/// Dropping the supervisor (and every [`SupervisorHandle`]) closes the
/// process input and lets the process finish on its own.
pub struct ProcessSupervisor {
    handle: SupervisorHandle,
    completion: Completion,
    stats: Arc<SupervisorStats>,
}

impl ProcessSupervisor {
    /// Spawn the supervisor task, which launches the first process right away.
    #[instrument(name = "spawn_supervisor", skip(launcher, config, events), fields(launcher = launcher.name()))]
    pub fn spawn(
        role: ProcessRole,
        launcher: Arc<dyn ProcessLauncher>,
        config: SupervisorConfig,
        events: Option<Sender<RelayEvent>>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(SUPERVISOR_QUEUE_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ProcessState::Starting);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let stats = Arc::new(SupervisorStats::default());

        let mut supervisor = Supervisor {
            role,
            launcher,
            config,
            events,
            state_tx,
            stats: Arc::clone(&stats),
            current: None,
            instance: 0,
            attempt: 0,
            restart_at: None,
            drain_deadline: None,
            stopping: false,
            outcome: None,
        };

        // Callers observe Running or SpawnFailed, never a stale Starting.
        supervisor.start();

        tokio::spawn(supervisor.run(command_rx, outcome_tx));

        Self {
            handle: SupervisorHandle {
                role,
                commands: command_tx,
                state: state_rx,
            },
            completion: Completion {
                role,
                outcome: outcome_rx,
            },
            stats,
        }
    }

    /// Role of the supervised process.
    pub fn role(&self) -> ProcessRole {
        self.handle.role
    }

    /// A cloneable handle for feeding chunks.
    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    /// A waiter for the final outcome.
    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }

    /// Shared counters.
    pub fn stats(&self) -> Arc<SupervisorStats> {
        Arc::clone(&self.stats)
    }

    /// True iff a process is running.
    pub fn is_ready(&self) -> bool {
        self.handle.is_ready()
    }

    /// Current state.
    pub fn state(&self) -> ProcessState {
        self.handle.state()
    }

    /// See [`SupervisorHandle::write`].
    pub fn write(&self, chunk: Chunk) -> WriteOutcome {
        self.handle.write(chunk)
    }

    /// See [`SupervisorHandle::end_input`].
    pub fn end_input(&self) {
        self.handle.end_input();
    }

    /// See [`SupervisorHandle::terminate`].
    pub fn terminate(&self, signal: TerminateSignal) {
        self.handle.terminate(signal);
    }
}

struct RunningProcess {
    instance: u64,
    /// Queue of the writer task; dropping it closes the process input.
    input: Option<mpsc::Sender<Chunk>>,
    writer: JoinHandle<()>,
    handle: Box<dyn ProcessHandle>,
    started_at: Instant,
    intentional: bool,
}

impl Drop for RunningProcess {
    fn drop(&mut self) {
        // Chunks still queued for a reaped instance are discarded.
        self.writer.abort();
    }
}

struct Supervisor {
    role: ProcessRole,
    launcher: Arc<dyn ProcessLauncher>,
    config: SupervisorConfig,
    events: Option<Sender<RelayEvent>>,
    state_tx: watch::Sender<ProcessState>,
    stats: Arc<SupervisorStats>,
    current: Option<RunningProcess>,
    instance: u64,
    attempt: u32,
    restart_at: Option<Instant>,
    drain_deadline: Option<Instant>,
    stopping: bool,
    outcome: Option<ExitOutcome>,
}

impl Supervisor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SupervisorCommand>,
        outcome_tx: watch::Sender<Option<ExitOutcome>>,
    ) {
        let mut commands_open = true;

        while self.outcome.is_none() {
            let restart_at = self.restart_at;
            let drain_deadline = self.drain_deadline;

            tokio::select! {
                biased;

                code = wait_exit(&mut self.current) => self.on_exit(code),

                _ = sleep_until(restart_at) => {
                    self.restart_at = None;
                    self.start();
                }

                _ = sleep_until(drain_deadline) => self.on_drain_timeout(),

                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle(command),
                    None => {
                        debug!(role = %self.role, "All handles released");
                        commands_open = false;
                        self.end_input();
                    }
                },
            }
        }

        let outcome = self.outcome.take().unwrap_or(ExitOutcome::Terminated);
        debug!(role = %self.role, ?outcome, "Supervisor finished");
        outcome_tx.send_replace(Some(outcome));
    }

    /// Launch a process instance. Failure stops the supervisor.
    fn start(&mut self) {
        match self.launcher.launch() {
            Ok(launched) => {
                self.instance += 1;
                let pid = launched.handle.id();
                info!(role = %self.role, instance = self.instance, ?pid, "Transcoder running");

                let (input_tx, input_rx) = mpsc::channel(SUPERVISOR_QUEUE_CAPACITY);
                let writer = tokio::spawn(feed_input(
                    self.role,
                    self.instance,
                    launched.input,
                    input_rx,
                    Arc::clone(&self.stats),
                ));

                self.current = Some(RunningProcess {
                    instance: self.instance,
                    input: Some(input_tx),
                    writer,
                    handle: launched.handle,
                    started_at: Instant::now(),
                    intentional: false,
                });
                self.emit(ProcessEvent::Spawned {
                    role: self.role,
                    instance: self.instance,
                    pid,
                });
                self.set_state(ProcessState::Running {
                    instance: self.instance,
                    pid,
                });
            }
            Err(e) => {
                error!(role = %self.role, "Failed to launch transcoder: {}", e);
                let reason = e.to_string();
                self.set_state(ProcessState::SpawnFailed {
                    reason: reason.clone(),
                });
                self.emit(ProcessEvent::SpawnFailed {
                    role: self.role,
                    reason: reason.clone(),
                });
                self.finish(ExitOutcome::SpawnFailed { reason });
            }
        }
    }

    fn handle(&mut self, command: SupervisorCommand) {
        match command {
            SupervisorCommand::Write(chunk) => self.write(chunk),
            SupervisorCommand::EndInput => self.end_input(),
            SupervisorCommand::Terminate(signal) => self.terminate(signal),
        }
    }

    fn write(&mut self, chunk: Chunk) {
        let Some(input) = self.current.as_ref().and_then(|p| p.input.as_ref()) else {
            trace!(role = %self.role, sequence = chunk.sequence, "Transcoder not accepting input, dropping chunk");
            self.stats.record_drop();
            return;
        };

        if let Err(
            mpsc::error::TrySendError::Full(chunk) | mpsc::error::TrySendError::Closed(chunk),
        ) = input.try_send(chunk)
        {
            self.stats.record_drop();
            trace!(role = %self.role, sequence = chunk.sequence, "Transcoder input backed up, dropping chunk");
        }
    }

    fn end_input(&mut self) {
        self.stopping = true;
        self.restart_at = None;

        match self.current.as_mut() {
            Some(process) => {
                if process.input.take().is_some() {
                    info!(role = %self.role, instance = process.instance, "Closed transcoder input");
                }
                self.arm_drain_deadline();
            }
            None => self.finish(ExitOutcome::Terminated),
        }
    }

    fn terminate(&mut self, signal: TerminateSignal) {
        self.stopping = true;
        self.restart_at = None;

        match self.current.as_mut() {
            Some(process) => {
                info!(role = %self.role, instance = process.instance, ?signal, "Terminating transcoder");
                process.intentional = true;
                if let Err(e) = process.handle.signal(signal) {
                    warn!(role = %self.role, "Failed to signal transcoder: {}", e);
                }
                self.arm_drain_deadline();
            }
            None => self.finish(ExitOutcome::Terminated),
        }
    }

    fn arm_drain_deadline(&mut self) {
        if self.drain_deadline.is_none() {
            self.drain_deadline = Some(Instant::now() + self.config.drain_timeout);
        }
    }

    fn on_drain_timeout(&mut self) {
        self.drain_deadline = None;
        if let Some(process) = self.current.as_mut() {
            warn!(
                role = %self.role,
                instance = process.instance,
                timeout = ?self.config.drain_timeout,
                "Transcoder did not exit in time, killing"
            );
            process.intentional = true;
            if let Err(e) = process.handle.signal(TerminateSignal::Kill) {
                warn!(role = %self.role, "Failed to kill transcoder: {}", e);
            }
        }
    }

    fn on_exit(&mut self, code: Option<i32>) {
        // Dropping the process closes its input.
        let Some(process) = self.current.take() else {
            return;
        };
        self.drain_deadline = None;

        let intentional = process.intentional;
        if code == Some(0) || intentional {
            info!(role = %self.role, instance = process.instance, ?code, "Transcoder exited");
        } else {
            warn!(role = %self.role, instance = process.instance, ?code, "Transcoder exited unexpectedly");
        }

        self.set_state(ProcessState::Exited {
            instance: process.instance,
            code,
            intentional,
        });
        self.emit(ProcessEvent::Exited {
            role: self.role,
            instance: process.instance,
            code,
            intentional,
        });

        match &self.config.restart {
            RestartPolicy::Always(backoff) if !self.stopping && !intentional => {
                if process.started_at.elapsed() >= backoff.stable_after {
                    self.attempt = 0;
                }
                self.attempt = self.attempt.saturating_add(1);
                let delay = backoff.delay_for_attempt(self.attempt);

                self.stats.record_restart();
                self.emit(ProcessEvent::Restarting {
                    role: self.role,
                    attempt: self.attempt,
                    delay_ms: delay.as_millis() as u64,
                });
                self.set_state(ProcessState::Starting);

                if delay.is_zero() {
                    self.start();
                } else {
                    info!(role = %self.role, ?delay, "Restarting transcoder after delay");
                    self.restart_at = Some(Instant::now() + delay);
                }
            }
            _ => {
                let outcome = match code {
                    Some(0) => ExitOutcome::Success,
                    _ if intentional => ExitOutcome::Terminated,
                    code => ExitOutcome::Failed { code },
                };
                self.finish(outcome);
            }
        }
    }

    fn finish(&mut self, outcome: ExitOutcome) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
        }
    }

    fn set_state(&self, state: ProcessState) {
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: ProcessEvent) {
        if let Some(events) = &self.events {
            if let Err(e) = events.try_send(RelayEvent::Process(event)) {
                warn!("Failed to send event: {}", e);
            }
        }
    }
}

/// Write queued chunks to one process instance until the queue closes,
/// then close the process input.
async fn feed_input(
    role: ProcessRole,
    instance: u64,
    mut input: ProcessInput,
    mut chunks: mpsc::Receiver<Chunk>,
    stats: Arc<SupervisorStats>,
) {
    while let Some(chunk) = chunks.recv().await {
        match input.write_all(&chunk.data).await {
            Ok(()) => stats.record_write(chunk.len()),
            Err(e) => {
                // The exit observer decides whether the process is gone.
                stats.record_write_failure();
                warn!(
                    %role,
                    instance,
                    sequence = chunk.sequence,
                    "Failed to write chunk to transcoder: {}",
                    e
                );
            }
        }
    }
    debug!(%role, instance, "Transcoder input drained");
}

async fn wait_exit(current: &mut Option<RunningProcess>) -> Option<i32> {
    match current {
        Some(process) => match process.handle.wait().await {
            Ok(code) => code,
            Err(e) => {
                warn!("Failed to wait for transcoder: {}", e);
                None
            }
        },
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLauncher;

    fn live_config() -> SupervisorConfig {
        SupervisorConfig::for_role(ProcessRole::Live, Backoff::immediate(), Duration::from_secs(5))
    }

    fn archival_config() -> SupervisorConfig {
        SupervisorConfig::for_role(
            ProcessRole::Archival,
            Backoff::immediate(),
            Duration::from_secs(5),
        )
    }

    async fn wait_for_instance(handle: &SupervisorHandle, instance: u64) {
        let mut state = handle.subscribe();
        state
            .wait_for(|s| s.running_instance() == Some(instance))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_running_once_launched() {
        let launcher = FakeLauncher::new();
        let supervisor =
            ProcessSupervisor::spawn(ProcessRole::Live, launcher.clone(), live_config(), None);

        assert!(supervisor.is_ready());
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test]
    async fn test_chunks_written_in_order() {
        let launcher = FakeLauncher::new();
        let supervisor =
            ProcessSupervisor::spawn(ProcessRole::Live, launcher.clone(), live_config(), None);

        for (i, data) in ["a1", "b2", "c3"].iter().enumerate() {
            assert_eq!(
                supervisor.write(Chunk::new(i as u64, data.as_bytes().to_vec())),
                WriteOutcome::Queued
            );
        }

        let process = launcher.instance(0).unwrap();
        assert_eq!(process.wait_for_bytes(6).await, b"a1b2c3");
    }

    #[tokio::test]
    async fn test_live_restarts_after_crash() {
        let launcher = FakeLauncher::new();
        let supervisor =
            ProcessSupervisor::spawn(ProcessRole::Live, launcher.clone(), live_config(), None);
        let handle = supervisor.handle();

        handle.write(Chunk::new(0, &b"c1"[..]));
        let first = launcher.instance(0).unwrap();
        first.wait_for_bytes(2).await;

        assert!(first.crash(Some(1)));
        wait_for_instance(&handle, 2).await;

        handle.write(Chunk::new(1, &b"c2"[..]));
        handle.write(Chunk::new(2, &b"c3"[..]));

        let second = launcher.instance(1).unwrap();
        assert_eq!(second.wait_for_bytes(4).await, b"c2c3");
        assert_eq!(first.received(), b"c1");
        assert_eq!(supervisor.stats().restarts(), 1);
    }

    #[tokio::test]
    async fn test_live_restarts_on_clean_exit_too() {
        let launcher = FakeLauncher::new();
        let supervisor =
            ProcessSupervisor::spawn(ProcessRole::Live, launcher.clone(), live_config(), None);

        launcher.instance(0).unwrap().crash(Some(0));
        wait_for_instance(&supervisor.handle(), 2).await;

        launcher.instance(1).unwrap().crash(None);
        wait_for_instance(&supervisor.handle(), 3).await;

        assert_eq!(launcher.launches(), 3);
    }

    #[tokio::test]
    async fn test_terminate_suppresses_restart() {
        let launcher = FakeLauncher::new();
        let supervisor =
            ProcessSupervisor::spawn(ProcessRole::Live, launcher.clone(), live_config(), None);
        let mut completion = supervisor.completion();

        supervisor.terminate(TerminateSignal::Kill);

        assert!(matches!(completion.wait().await, Err(TranscoderError::Terminated)));
        assert_eq!(launcher.launches(), 1);
        assert_eq!(
            launcher.instance(0).unwrap().signals(),
            vec![TerminateSignal::Kill]
        );
        assert!(!supervisor.is_ready());
    }

    #[tokio::test]
    async fn test_archival_not_restarted_and_reports_failure() {
        let launcher = FakeLauncher::new();
        let supervisor = ProcessSupervisor::spawn(
            ProcessRole::Archival,
            launcher.clone(),
            archival_config(),
            None,
        );
        let mut completion = supervisor.completion();

        launcher.instance(0).unwrap().crash(Some(1));

        assert!(matches!(
            completion.wait().await,
            Err(TranscoderError::ExitedWithFailure(Some(1)))
        ));
        assert_eq!(launcher.launches(), 1);
        assert_eq!(
            supervisor.write(Chunk::new(0, &b"late"[..])),
            WriteOutcome::Dropped(DropReason::NotRunning)
        );
    }

    #[tokio::test]
    async fn test_end_input_lets_archival_flush() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp3");
        let launcher = FakeLauncher::with_output(&output);
        let supervisor = ProcessSupervisor::spawn(
            ProcessRole::Archival,
            launcher.clone(),
            archival_config(),
            None,
        );
        let mut completion = supervisor.completion();

        supervisor.write(Chunk::new(0, &b"audio"[..]));
        supervisor.end_input();

        completion.wait().await.unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"audio");
        assert!(launcher.instance(0).unwrap().signals().is_empty());
    }

    #[tokio::test]
    async fn test_release_behaves_like_end_input() {
        let launcher = FakeLauncher::new();
        let supervisor = ProcessSupervisor::spawn(
            ProcessRole::Archival,
            launcher.clone(),
            archival_config(),
            None,
        );
        let mut completion = supervisor.completion();
        drop(supervisor);

        completion.wait().await.unwrap();
        assert!(launcher.instance(0).unwrap().input_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout_kills_stuck_process() {
        let launcher = FakeLauncher::stubborn();
        let supervisor = ProcessSupervisor::spawn(
            ProcessRole::Archival,
            launcher.clone(),
            archival_config(),
            None,
        );
        let mut completion = supervisor.completion();

        supervisor.end_input();

        assert!(matches!(completion.wait().await, Err(TranscoderError::Terminated)));
        assert_eq!(
            launcher.instance(0).unwrap().signals(),
            vec![TerminateSignal::Kill]
        );
    }

    #[tokio::test]
    async fn test_kill_reaches_process_that_stopped_reading() {
        let launcher = FakeLauncher::unread();
        let supervisor =
            ProcessSupervisor::spawn(ProcessRole::Live, launcher.clone(), live_config(), None);
        let mut completion = supervisor.completion();

        assert_eq!(
            supervisor.write(Chunk::new(0, vec![0u8; 1024])),
            WriteOutcome::Queued
        );
        supervisor.terminate(TerminateSignal::Kill);

        let finished = tokio::time::timeout(Duration::from_secs(3), completion.wait()).await;
        assert!(matches!(finished, Ok(Err(TranscoderError::Terminated))));
        assert_eq!(
            launcher.instance(0).unwrap().signals(),
            vec![TerminateSignal::Kill]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout_fires_while_input_is_stalled() {
        let launcher = FakeLauncher::unread();
        let supervisor = ProcessSupervisor::spawn(
            ProcessRole::Archival,
            launcher.clone(),
            archival_config(),
            None,
        );
        let mut completion = supervisor.completion();

        supervisor.write(Chunk::new(0, vec![0u8; 1024]));
        supervisor.write(Chunk::new(1, vec![0u8; 1024]));
        supervisor.end_input();

        let before = Instant::now();
        assert!(matches!(completion.wait().await, Err(TranscoderError::Terminated)));
        assert!(before.elapsed() >= Duration::from_secs(5));
        assert_eq!(
            launcher.instance(0).unwrap().signals(),
            vec![TerminateSignal::Kill]
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_is_not_ready() {
        let launcher = FakeLauncher::new();
        launcher.fail_next_launches(1);
        let supervisor =
            ProcessSupervisor::spawn(ProcessRole::Live, launcher.clone(), live_config(), None);
        let mut completion = supervisor.completion();

        assert!(!supervisor.is_ready());
        assert!(matches!(supervisor.state(), ProcessState::SpawnFailed { .. }));
        assert!(matches!(completion.wait().await, Err(TranscoderError::SpawnFailed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_restart() {
        let launcher = FakeLauncher::new();
        let config = SupervisorConfig {
            restart: RestartPolicy::Always(Backoff::exponential(
                Duration::from_secs(1),
                Duration::from_secs(8),
            )),
            drain_timeout: Duration::from_secs(5),
        };
        let supervisor = ProcessSupervisor::spawn(ProcessRole::Live, launcher.clone(), config, None);
        let handle = supervisor.handle();

        launcher.instance(0).unwrap().crash(Some(1));
        let mut state = handle.subscribe();
        state.wait_for(|s| *s == ProcessState::Starting).await.unwrap();

        assert_eq!(
            handle.write(Chunk::new(0, &b"lost"[..])),
            WriteOutcome::Dropped(DropReason::NotRunning)
        );

        let before = Instant::now();
        wait_for_instance(&handle, 2).await;
        assert!(before.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let launcher = FakeLauncher::new();
        let supervisor =
            ProcessSupervisor::spawn(ProcessRole::Live, launcher.clone(), live_config(), Some(tx));

        launcher.instance(0).unwrap().crash(Some(1));
        wait_for_instance(&supervisor.handle(), 2).await;

        let events: Vec<ProcessEvent> = rx
            .try_iter()
            .filter_map(|e| match e {
                RelayEvent::Process(p) => Some(p),
                _ => None,
            })
            .collect();

        assert!(matches!(events[0], ProcessEvent::Spawned { instance: 1, .. }));
        assert!(matches!(
            events[1],
            ProcessEvent::Exited {
                code: Some(1),
                intentional: false,
                ..
            }
        ));
        assert!(matches!(events[2], ProcessEvent::Restarting { attempt: 1, .. }));
        assert!(matches!(events[3], ProcessEvent::Spawned { instance: 2, .. }));
    }
}
