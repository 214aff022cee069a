//! Per-session resources: the two supervisors and the warm-up timer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{debug, info, instrument, warn};

use relay_ipc::{ProcessRole, RelayEvent, SessionId};
use relay_transcoder::{
    Completion, ProcessLauncher, ProcessSupervisor, SupervisorConfig, TerminateSignal,
};

use crate::metrics::SessionStats;
use crate::pipeline::SessionTaps;
use crate::timer::ScheduledTask;

/// Everything a session owns while it runs.
///
/// Supervisors are held until the session drains; completion waiters are
/// kept until the session is dropped so a successor can wait for both
/// processes to be reaped.
pub struct SessionResources {
    session_id: SessionId,
    generation: u64,
    archival_path: PathBuf,
    live: Option<ProcessSupervisor>,
    archival: Option<ProcessSupervisor>,
    live_completion: Option<Completion>,
    archival_completion: Option<Completion>,
    stats: SessionStats,
    warmup: Option<ScheduledTask>,
}

impl SessionResources {
    pub fn new(session_id: SessionId, generation: u64, archival_path: PathBuf) -> Self {
        Self {
            session_id,
            generation,
            archival_path,
            live: None,
            archival: None,
            live_completion: None,
            archival_completion: None,
            stats: SessionStats::default(),
            warmup: None,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Where the archival encoder writes.
    pub fn archival_path(&self) -> &Path {
        &self.archival_path
    }

    /// Start a supervisor for `role`.
    #[instrument(name = "spawn_transcoder", skip(self, launcher, config, events), fields(session_id = %self.session_id))]
    pub fn spawn(
        &mut self,
        role: ProcessRole,
        launcher: Arc<dyn ProcessLauncher>,
        config: SupervisorConfig,
        events: Sender<RelayEvent>,
    ) {
        let supervisor = ProcessSupervisor::spawn(role, launcher, config, Some(events));
        if !supervisor.is_ready() {
            warn!(%role, "Transcoder is not running, its chunks will be dropped");
        }

        let completion = supervisor.completion();
        let stats = Some(supervisor.stats());
        match role {
            ProcessRole::Live => {
                self.live = Some(supervisor);
                self.live_completion = Some(completion);
                self.stats.live = stats;
            }
            ProcessRole::Archival => {
                self.archival = Some(supervisor);
                self.archival_completion = Some(completion);
                self.stats.archival = stats;
            }
        }
    }

    /// Keep the warm-up timer; replacing or dropping it cancels it.
    pub fn set_warmup(&mut self, task: ScheduledTask) {
        self.warmup = Some(task);
    }

    /// Handles for the pipeline.
    pub fn taps(&self) -> SessionTaps {
        SessionTaps {
            session_id: self.session_id.clone(),
            generation: self.generation,
            live: self.live.as_ref().map(ProcessSupervisor::handle),
            archival: self.archival.as_ref().map(ProcessSupervisor::handle),
        }
    }

    /// Supervisor counters for metrics.
    pub fn stats(&self) -> SessionStats {
        self.stats.clone()
    }

    /// True while supervisors are held.
    pub fn is_running(&self) -> bool {
        self.live.is_some() || self.archival.is_some()
    }

    /// Kill the live transcoder, let the archival encoder flush, and release
    /// both supervisors.
    #[instrument(name = "drain_session", skip(self), fields(session_id = %self.session_id))]
    pub fn drain(&mut self) {
        self.release(TerminateSignal::Kill);
    }

    fn release(&mut self, live_signal: TerminateSignal) {
        if let Some(task) = self.warmup.take() {
            task.cancel();
        }
        if let Some(live) = self.live.take() {
            live.terminate(live_signal);
        }
        if let Some(archival) = self.archival.take() {
            archival.end_input();
        }
        debug!("Session supervisors released");
    }

    /// Waiter for the archival encoder.
    pub fn archival_completion(&self) -> Option<Completion> {
        self.archival_completion.clone()
    }

    /// Wait until both processes have been reaped.
    ///
    /// A live segmenter still running here is being replaced rather than
    /// drained, so it gets SIGINT and writes out its last segment. The
    /// supervisor's drain timeout kills it if it does not exit.
    #[instrument(name = "reap_session", skip(self), fields(session_id = %self.session_id))]
    pub async fn reap(mut self) {
        self.release(TerminateSignal::Interrupt);

        let completions = self
            .live_completion
            .take()
            .into_iter()
            .chain(self.archival_completion.take());
        for mut completion in completions {
            let role = completion.role();
            match completion.wait().await {
                Ok(()) => debug!(%role, "Transcoder reaped"),
                Err(e) => debug!(%role, "Transcoder reaped: {}", e),
            }
        }
        info!("Session resources released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_transcoder::testing::FakeLauncher;
    use relay_transcoder::Backoff;
    use std::time::Duration;

    fn config(role: ProcessRole) -> SupervisorConfig {
        SupervisorConfig::for_role(role, Backoff::immediate(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_reap_waits_for_both_processes() {
        let (events, _rx) = crossbeam_channel::unbounded();
        let live = FakeLauncher::new();
        let archival = FakeLauncher::new();
        let mut session = SessionResources::new(
            SessionId::new("r1").unwrap(),
            1,
            PathBuf::from("mp3/live-stream-r1.mp3"),
        );

        session.spawn(ProcessRole::Live, live.clone(), config(ProcessRole::Live), events.clone());
        session.spawn(ProcessRole::Archival, archival.clone(), config(ProcessRole::Archival), events);
        assert!(session.is_running());

        session.reap().await;

        let live = live.instance(0).unwrap();
        let archival = archival.instance(0).unwrap();
        assert!(live.has_exited());
        assert_eq!(live.signals(), vec![TerminateSignal::Interrupt]);
        assert!(archival.has_exited());
        assert!(archival.input_closed());
        assert!(archival.signals().is_empty());
    }

    #[tokio::test]
    async fn test_reap_after_drain_keeps_the_kill() {
        let (events, _rx) = crossbeam_channel::unbounded();
        let live = FakeLauncher::new();
        let mut session = SessionResources::new(
            SessionId::new("r1").unwrap(),
            1,
            PathBuf::from("mp3/live-stream-r1.mp3"),
        );
        session.spawn(ProcessRole::Live, live.clone(), config(ProcessRole::Live), events);

        session.drain();
        session.reap().await;

        assert_eq!(live.instance(0).unwrap().signals(), vec![TerminateSignal::Kill]);
    }

    #[tokio::test]
    async fn test_drain_clears_taps() {
        let (events, _rx) = crossbeam_channel::unbounded();
        let mut session = SessionResources::new(
            SessionId::new("r1").unwrap(),
            3,
            PathBuf::from("out.mp3"),
        );
        session.spawn(
            ProcessRole::Live,
            FakeLauncher::new(),
            config(ProcessRole::Live),
            events,
        );

        session.drain();

        let taps = session.taps();
        assert_eq!(taps.generation, 3);
        assert!(taps.live.is_none());
        assert!(taps.archival.is_none());
        assert!(session.archival_completion().is_none());
    }
}
