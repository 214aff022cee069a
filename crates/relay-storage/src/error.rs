//! Error types for the storage module.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while storing recordings or their metadata.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem access failed.
    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The object key would escape the store root.
    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    /// The public base URL is unusable.
    #[error("Invalid public URL: {0}")]
    Url(#[from] url::ParseError),

    /// The metadata document could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend refused the request.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
