//! Error types for the transcoder module.

use std::io;

use thiserror::Error;

/// Errors that can occur while running a transcoder.
#[derive(Debug, Error)]
pub enum TranscoderError {
    /// The process could not be spawned.
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The process was spawned without a writable stdin.
    #[error("Transcoder input was not captured")]
    MissingInput,

    /// The supervisor gave up launching the process.
    #[error("Transcoder could not be launched: {0}")]
    SpawnFailed(String),

    /// The process exited unsuccessfully.
    #[error("Transcoder exited with code {0:?}")]
    ExitedWithFailure(Option<i32>),

    /// The process was stopped before it finished on its own.
    #[error("Transcoder was terminated before finishing")]
    Terminated,

    /// The supervisor task ended without reporting an outcome.
    #[error("Transcoder supervisor stopped unexpectedly")]
    Lost,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
