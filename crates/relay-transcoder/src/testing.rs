//! In-process stand-ins for ffmpeg, used by tests.
//!
//! A [`FakeLauncher`] hands out processes backed by an in-memory pipe. Each
//! process records what it was fed and exits on demand, on a signal, or when
//! its input closes. Processes from [`FakeLauncher::unread`] never read, so
//! writes to them stall once the pipe is full.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;

use crate::error::TranscoderError;
use crate::ffmpeg::LauncherFactory;
use crate::process::{LaunchedProcess, ProcessHandle, ProcessLauncher, TerminateSignal};
use crate::TranscoderResult;

const PIPE_CAPACITY: usize = 64 * 1024;
const STALLED_PIPE_CAPACITY: usize = 16;

/// Exit code reported after an interrupt, as ffmpeg does.
pub const INTERRUPT_EXIT_CODE: i32 = 255;

#[derive(Debug, Clone)]
enum OnEof {
    Exit,
    WriteAndExit(PathBuf),
    Ignore,
}

/// Launcher of fake processes.
pub struct FakeLauncher {
    on_eof: OnEof,
    reads_input: bool,
    failures: AtomicU32,
    launches: AtomicUsize,
    processes: Mutex<Vec<FakeProcess>>,
}

impl FakeLauncher {
    /// Processes exit with code 0 once their input closes.
    pub fn new() -> Arc<Self> {
        Self::build(OnEof::Exit)
    }

    /// Processes write everything they received to `output`, then exit with code 0.
    pub fn with_output(output: impl AsRef<Path>) -> Arc<Self> {
        Self::build(OnEof::WriteAndExit(output.as_ref().to_path_buf()))
    }

    /// Processes keep running after their input closes.
    pub fn stubborn() -> Arc<Self> {
        Self::build(OnEof::Ignore)
    }

    /// Processes never read their input and run until signalled.
    pub fn unread() -> Arc<Self> {
        Self::build_with(OnEof::Ignore, false)
    }

    fn build(on_eof: OnEof) -> Arc<Self> {
        Self::build_with(on_eof, true)
    }

    fn build_with(on_eof: OnEof, reads_input: bool) -> Arc<Self> {
        Arc::new(Self {
            on_eof,
            reads_input,
            failures: AtomicU32::new(0),
            launches: AtomicUsize::new(0),
            processes: Mutex::new(Vec::new()),
        })
    }

    /// Make the next `count` launches fail.
    pub fn fail_next_launches(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Successful launches so far.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// The `index`-th launched process.
    pub fn instance(&self, index: usize) -> Option<FakeProcess> {
        self.processes.lock().get(index).cloned()
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self) -> TranscoderResult<LaunchedProcess> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TranscoderError::Spawn {
                program: "fake-ffmpeg".to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "launch failure injected"),
            });
        }

        let index = self.launches.fetch_add(1, Ordering::SeqCst);
        let process = FakeProcess::new(index as u32 + 1);
        let shared = process.clone();

        if !self.reads_input {
            let (writer, reader) = tokio::io::duplex(STALLED_PIPE_CAPACITY);
            tokio::spawn(async move {
                let mut exited = shared.exit.subscribe();
                let _ = exited.wait_for(Option::is_some).await;
                drop(reader);
            });
            self.processes.lock().push(process.clone());
            return Ok(LaunchedProcess {
                input: Box::new(writer),
                handle: Box::new(FakeHandle { process }),
            });
        }

        let (writer, mut reader) = tokio::io::duplex(PIPE_CAPACITY);
        let on_eof = self.on_eof.clone();
        tokio::spawn(async move {
            let mut exited = shared.exit.subscribe();
            let mut buf = vec![0u8; 8192];
            loop {
                tokio::select! {
                    read = reader.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => shared.received.send_modify(|r| r.extend_from_slice(&buf[..n])),
                    },
                    // Dropping the reader breaks the pipe, like a dead process.
                    _ = exited.wait_for(Option::is_some) => return,
                }
            }

            shared.input_closed.send_replace(true);
            match on_eof {
                OnEof::Exit => {
                    shared.exit_with(Some(0));
                }
                OnEof::WriteAndExit(path) => {
                    // Blocking write keeps paused-clock tests deterministic.
                    let code = match std::fs::write(&path, shared.received()) {
                        Ok(()) => Some(0),
                        Err(_) => Some(1),
                    };
                    shared.exit_with(code);
                }
                OnEof::Ignore => {}
            }
        });

        self.processes.lock().push(process.clone());

        Ok(LaunchedProcess {
            input: Box::new(writer),
            handle: Box::new(FakeHandle { process }),
        })
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// One fake process.
#[derive(Clone)]
pub struct FakeProcess {
    pid: u32,
    received: Arc<watch::Sender<Vec<u8>>>,
    input_closed: Arc<watch::Sender<bool>>,
    exit: Arc<watch::Sender<Option<Option<i32>>>>,
    signals: Arc<Mutex<Vec<TerminateSignal>>>,
}

impl FakeProcess {
    fn new(pid: u32) -> Self {
        Self {
            pid,
            received: Arc::new(watch::Sender::new(Vec::new())),
            input_closed: Arc::new(watch::Sender::new(false)),
            exit: Arc::new(watch::Sender::new(None)),
            signals: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Bytes received so far.
    pub fn received(&self) -> Vec<u8> {
        self.received.borrow().clone()
    }

    /// Wait until at least `len` bytes arrived and return them.
    pub async fn wait_for_bytes(&self, len: usize) -> Vec<u8> {
        let mut rx = self.received.subscribe();
        let received = match rx.wait_for(|r| r.len() >= len).await {
            Ok(received) => received.clone(),
            Err(_) => self.received(),
        };
        received
    }

    /// Returns true once the process input was closed.
    pub fn input_closed(&self) -> bool {
        *self.input_closed.borrow()
    }

    /// Exit with `code`. Returns false if the process had already exited.
    pub fn crash(&self, code: Option<i32>) -> bool {
        self.exit_with(code)
    }

    /// Returns true once the process has exited.
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Signals delivered so far.
    pub fn signals(&self) -> Vec<TerminateSignal> {
        self.signals.lock().clone()
    }

    fn exit_with(&self, code: Option<i32>) -> bool {
        self.exit.send_if_modified(|exit| {
            if exit.is_some() {
                return false;
            }
            *exit = Some(code);
            true
        })
    }
}

struct FakeHandle {
    process: FakeProcess,
}

#[async_trait]
impl ProcessHandle for FakeHandle {
    fn id(&self) -> Option<u32> {
        Some(self.process.pid)
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let mut rx = self.process.exit.subscribe();
        let exit = *rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "fake process lost"))?;
        Ok(exit.flatten())
    }

    fn signal(&mut self, signal: TerminateSignal) -> io::Result<()> {
        self.process.signals.lock().push(signal);
        let code = match signal {
            TerminateSignal::Interrupt => Some(INTERRUPT_EXIT_CODE),
            TerminateSignal::Kill => None,
        };
        self.process.exit_with(code);
        Ok(())
    }
}

/// Fake launchers for both roles.
///
/// Archival launchers write what they received to the requested path when
/// their input closes, so callers find a real file afterwards.
pub struct FakeLaunchers {
    live: Arc<FakeLauncher>,
    archival: Mutex<Vec<(PathBuf, Arc<FakeLauncher>)>>,
    archival_failures: AtomicU32,
}

impl FakeLaunchers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            live: FakeLauncher::new(),
            archival: Mutex::new(Vec::new()),
            archival_failures: AtomicU32::new(0),
        })
    }

    /// The shared live launcher.
    pub fn live_launcher(&self) -> Arc<FakeLauncher> {
        Arc::clone(&self.live)
    }

    /// The `index`-th archival launcher and its output path.
    pub fn archival_launcher(&self, index: usize) -> Option<(PathBuf, Arc<FakeLauncher>)> {
        self.archival.lock().get(index).cloned()
    }

    /// Archival launchers created so far.
    pub fn archival_count(&self) -> usize {
        self.archival.lock().len()
    }

    /// Make the next `count` archival launchers fail to launch.
    pub fn fail_next_archival(&self, count: u32) {
        self.archival_failures.store(count, Ordering::SeqCst);
    }
}

impl LauncherFactory for FakeLaunchers {
    fn live(&self) -> Arc<dyn ProcessLauncher> {
        self.live.clone()
    }

    fn archival(&self, output: &Path) -> Arc<dyn ProcessLauncher> {
        let launcher = FakeLauncher::with_output(output);
        if self
            .archival_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            launcher.fail_next_launches(1);
        }
        self.archival
            .lock()
            .push((output.to_path_buf(), Arc::clone(&launcher)));
        launcher
    }
}
