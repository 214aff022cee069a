//! Supervision of the external ffmpeg transcoders.
//!
//! Each transcoder runs as a child process fed through its stdin. A
//! [`ProcessSupervisor`] owns one such process: it starts it, writes chunks to
//! it, observes its exit and applies the [`RestartPolicy`] of its role. The
//! HLS segmenter is restarted whenever it dies; the archival encoder is not.

mod error;
mod ffmpeg;
mod policy;
mod process;
mod supervisor;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::TranscoderError;
pub use ffmpeg::{
    archival_launcher, archival_mp3_args, live_hls_args, live_launcher, FfmpegLaunchers,
    LauncherFactory,
};
pub use policy::{Backoff, RestartPolicy};
pub use process::{
    CommandLauncher, LaunchedProcess, ProcessHandle, ProcessInput, ProcessLauncher,
    TerminateSignal,
};
pub use supervisor::{
    Completion, DropReason, ExitOutcome, ProcessState, ProcessSupervisor, SupervisorConfig,
    SupervisorHandle, SupervisorStats, WriteOutcome,
};

/// Chunks a supervisor will hold before dropping new ones.
pub const SUPERVISOR_QUEUE_CAPACITY: usize = 512;

/// Result type for transcoder operations.
pub type TranscoderResult<T> = Result<T, TranscoderError>;

/// Default time an encoder gets to flush after its input closes.
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;
