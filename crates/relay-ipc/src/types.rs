//! Common types used across relay messages.

use std::fmt::{self, Write as _};
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest accepted session identifier.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Longest escaped identifier, leaving room for the file name around it.
const MAX_FILE_STEM_LEN: usize = 200;

/// Introduces a hex-escaped byte in [`SessionId::file_stem`].
const STEM_ESCAPE: char = '~';

/// Caller-supplied identifier of a broadcast session (the radio id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

/// Rejected session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionIdError {
    #[error("session id is empty")]
    Empty,

    #[error("session id is too long")]
    TooLong,
}

impl SessionId {
    /// Validate and wrap an identifier.
    pub fn new(id: impl Into<String>) -> Result<Self, SessionIdError> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(SessionIdError::Empty);
        }
        if trimmed.chars().count() > MAX_SESSION_ID_LEN {
            return Err(SessionIdError::TooLong);
        }
        let id = Self(trimmed.to_string());
        if id.file_stem().len() > MAX_FILE_STEM_LEN {
            return Err(SessionIdError::TooLong);
        }
        Ok(id)
    }

    /// The identifier as given.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-, key- and URL-safe form. `[A-Za-z0-9_-]` is kept and every
    /// other byte becomes `~XX`, so distinct ids never share a stem.
    pub fn file_stem(&self) -> String {
        let mut stem = String::with_capacity(self.0.len());
        for byte in self.0.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
                stem.push(char::from(byte));
            } else {
                // Writing to a String cannot fail.
                let _ = write!(stem, "{STEM_ESCAPE}{byte:02X}");
            }
        }
        stem
    }
}

impl TryFrom<String> for SessionId {
    type Error = SessionIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One unit of producer audio, tagged with its arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Arrival order within the producer connection, starting at zero.
    pub sequence: u64,

    /// Raw container bytes as received.
    pub data: Bytes,
}

impl Chunk {
    /// Create a chunk.
    pub fn new(sequence: u64, data: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            data: data.into(),
        }
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Which transcoder a supervisor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessRole {
    /// HLS segmenter; restarted whenever it exits.
    Live,

    /// Single-file MP3 encoder; never restarted.
    Archival,
}

impl ProcessRole {
    /// Returns the display name for this role.
    pub fn name(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Archival => "archival",
        }
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of a successful finalize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeReceipt {
    /// Finalized session.
    pub session_id: SessionId,

    /// Public URL of the uploaded archival file.
    pub audio_url: String,
}

/// Relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// HTTP listener.
    pub server: ServerConfig,

    /// Output directories and files.
    pub paths: PathsConfig,

    /// External transcoder settings.
    pub transcoder: TranscoderConfig,

    /// Delays and timeouts.
    pub timing: TimingConfig,

    /// Object and metadata store settings.
    pub storage: StorageConfig,

    /// Session defaults.
    pub session: SessionConfig,

    /// Log filter directive used when `RUST_LOG` is unset.
    pub log_level: Option<String>,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind.
    pub host: String,

    /// Port to bind (default: 5001).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5001,
        }
    }
}

/// Filesystem layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory receiving the HLS playlist and segments.
    pub hls_dir: PathBuf,

    /// Directory receiving archival MP3 files.
    pub archive_dir: PathBuf,

    /// Root of the filesystem object store.
    pub object_root: PathBuf,

    /// JSON file backing the metadata store.
    pub metadata_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            hls_dir: PathBuf::from("hls"),
            archive_dir: PathBuf::from("mp3"),
            object_root: PathBuf::from("objects"),
            metadata_file: PathBuf::from("metadata.json"),
        }
    }
}

impl PathsConfig {
    /// Archival artifact path for a session.
    pub fn archival_path(&self, session_id: &SessionId) -> PathBuf {
        self.archive_dir
            .join(format!("live-stream-{}.mp3", session_id.file_stem()))
    }

    /// HLS playlist path.
    pub fn playlist_path(&self) -> PathBuf {
        self.hls_dir.join(format!("{HLS_STREAM_KEY}.m3u8"))
    }

    /// HLS segment filename pattern, as understood by ffmpeg.
    pub fn segment_pattern(&self) -> PathBuf {
        self.hls_dir.join(format!("{HLS_STREAM_KEY}_%03d.ts"))
    }
}

/// Base name of the HLS playlist and segments.
pub const HLS_STREAM_KEY: &str = "audio";

/// External transcoder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    /// Path or name of the ffmpeg binary.
    pub ffmpeg_path: PathBuf,

    /// Seconds an archival encoder may take to flush after its input ends.
    pub drain_timeout_secs: u64,

    /// Base delay before restarting a crashed live transcoder (0 = immediate).
    pub restart_delay_ms: u64,

    /// Upper bound for the doubling restart delay.
    pub max_restart_delay_ms: u64,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            drain_timeout_secs: 30,
            restart_delay_ms: 0,
            max_restart_delay_ms: 0,
        }
    }
}

impl TranscoderConfig {
    /// Drain timeout as a duration.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Delays and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Seconds between spawning the transcoders and opening the ingress.
    pub warmup_secs: u64,

    /// Seconds between a successful upload and deleting the local file.
    pub grace_secs: u64,

    /// Seconds finalize waits for the archival encoder to finish.
    pub finalize_wait_secs: u64,

    /// Seconds between metrics events.
    pub metrics_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            warmup_secs: 5,
            grace_secs: 5,
            finalize_wait_secs: 30,
            metrics_interval_secs: 5,
        }
    }
}

impl TimingConfig {
    pub fn warmup_delay(&self) -> Duration {
        Duration::from_secs(self.warmup_secs)
    }

    pub fn grace_delay(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn finalize_wait(&self) -> Duration {
        Duration::from_secs(self.finalize_wait_secs)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs.max(1))
    }
}

/// Object and metadata store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// URL under which the object root is publicly reachable.
    pub public_base_url: String,

    /// Metadata collection holding one record per session.
    pub collection: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            public_base_url: "http://localhost:5001/objects/".to_string(),
            collection: "radios".to_string(),
        }
    }
}

/// Session defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session started at boot, if any.
    pub auto_start: Option<String>,
}

/// Relay metrics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMetrics {
    /// Chunks received from producers.
    pub chunks_received: u64,

    /// Bytes received from producers.
    pub bytes_received: u64,

    /// HLS transcoder counters.
    pub live: RoleMetrics,

    /// Archival transcoder counters.
    pub archival: RoleMetrics,

    /// Seconds since the current session started.
    pub uptime_seconds: u64,
}

/// Per-transcoder counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleMetrics {
    /// Chunks handed to the supervisor.
    pub chunks_forwarded: u64,

    /// Chunks dropped because the process was not running or its queue was full.
    pub chunks_dropped: u64,

    /// Chunks written to the process input.
    pub chunks_written: u64,

    /// Failed writes to the process input.
    pub write_failures: u64,

    /// Process restarts.
    pub restarts: u64,
}
