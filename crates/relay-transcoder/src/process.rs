//! Launching external processes.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, instrument};

use relay_ipc::ProcessRole;

use crate::error::TranscoderError;
use crate::TranscoderResult;

/// Writable input of a launched process.
pub type ProcessInput = Box<dyn AsyncWrite + Send + Unpin>;

/// Signal used to stop a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateSignal {
    /// SIGINT: ffmpeg finalizes its output and exits.
    Interrupt,

    /// SIGKILL: immediate.
    Kill,
}

/// Control over a running process.
#[async_trait]
pub trait ProcessHandle: Send {
    /// OS process id, if known.
    fn id(&self) -> Option<u32>;

    /// Wait for the process to exit and return its exit code
    /// (`None` when killed by a signal). Must be cancel safe.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Deliver a termination signal without waiting.
    fn signal(&mut self, signal: TerminateSignal) -> io::Result<()>;
}

/// A freshly launched process.
pub struct LaunchedProcess {
    /// Writable input.
    pub input: ProcessInput,

    /// Lifecycle control.
    pub handle: Box<dyn ProcessHandle>,
}

/// Something that can start a transcoder process.
pub trait ProcessLauncher: Send + Sync {
    /// Start one process instance.
    fn launch(&self) -> TranscoderResult<LaunchedProcess>;

    /// Launcher name for diagnostics.
    fn name(&self) -> &str;
}

/// Launches a program with a fixed argument list, feeding it through stdin.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    role: ProcessRole,
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandLauncher {
    /// Create a launcher.
    pub fn new(role: ProcessRole, program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            role,
            program: program.into(),
            args,
        }
    }

    /// The argument list passed to the program.
    pub fn args(&self) -> &[OsString] {
        &self.args
    }
}

impl ProcessLauncher for CommandLauncher {
    #[instrument(name = "launch_transcoder", skip(self), fields(role = %self.role))]
    fn launch(&self) -> TranscoderResult<LaunchedProcess> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscoderError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(TranscoderError::MissingInput)?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(log_output(self.role, "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_output(self.role, "stderr", stderr));
        }

        debug!(pid = ?child.id(), program = %self.program.display(), "Transcoder spawned");

        Ok(LaunchedProcess {
            input: Box::new(stdin),
            handle: Box::new(ChildHandle { child }),
        })
    }

    fn name(&self) -> &str {
        self.role.name()
    }
}

/// Log every line of a diagnostic stream until it closes.
async fn log_output<R>(role: ProcessRole, stream: &'static str, output: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(output).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(%role, stream, "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(%role, stream, "Stopped reading transcoder output: {}", e);
                break;
            }
        }
    }
}

struct ChildHandle {
    child: Child,
}

#[async_trait]
impl ProcessHandle for ChildHandle {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    fn signal(&mut self, signal: TerminateSignal) -> io::Result<()> {
        match signal {
            TerminateSignal::Kill => self.child.start_kill(),
            TerminateSignal::Interrupt => interrupt(&mut self.child),
        }
    }
}

#[cfg(unix)]
fn interrupt(child: &mut Child) -> io::Result<()> {
    // Already reaped.
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;

    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGINT) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}
