//! Error types for the engine.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use relay_storage::StorageError;
use relay_transcoder::TranscoderError;

/// Errors returned by engine requests.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The request does not fit the current session state.
    #[error("Relay is busy ({state})")]
    Busy { state: &'static str },

    /// The archival encoder did not finish cleanly.
    #[error("Archival encoder failed: {0}")]
    ArchivalFailed(#[source] TranscoderError),

    /// The archival encoder was still running when the wait ran out.
    #[error("Archival encoder did not finish within {0:?}")]
    ArchivalTimeout(Duration),

    /// Uploading the recording failed.
    #[error(transparent)]
    Handoff(#[from] HandoffError),

    /// The engine task is gone.
    #[error("Engine stopped")]
    Stopped,

    /// The engine answered with a reply of the wrong kind.
    #[error("Unexpected engine reply")]
    UnexpectedReply,
}

impl EngineError {
    /// Returns true if the archival file does not exist.
    pub fn is_missing_artifact(&self) -> bool {
        matches!(self, Self::Handoff(HandoffError::ArtifactNotFound { .. }))
    }
}

/// Errors of the upload handoff. The local file is kept on every error.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// No archival file at the expected path.
    #[error("Audio file not found: {}", path.display())]
    ArtifactNotFound { path: PathBuf },

    /// The archival file exists but could not be read.
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The object store rejected the upload.
    #[error("Upload failed: {0}")]
    Upload(#[source] StorageError),

    /// The object store could not produce a public URL.
    #[error("Public URL unavailable: {0}")]
    PublicUrl(#[source] StorageError),

    /// The metadata store rejected the record.
    #[error("Metadata update failed: {0}")]
    Metadata(#[source] StorageError),
}
