//! Fixed ffmpeg invocations for the two transcoder roles.

use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;

use relay_ipc::{PathsConfig, ProcessRole, TranscoderConfig};

use crate::process::{CommandLauncher, ProcessLauncher};

/// Input container sent by the producer.
const INPUT_FORMAT: &str = "webm";

/// Audio bitrate for both outputs.
const AUDIO_BITRATE: &str = "128k";

/// Target HLS segment duration in seconds.
const HLS_SEGMENT_SECS: &str = "4";

/// Segments kept in the playlist; older ones are deleted.
const HLS_LIST_SIZE: &str = "20";

/// Arguments of the HLS segmenter.
pub fn live_hls_args(paths: &PathsConfig) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "-f",
        INPUT_FORMAT,
        "-i",
        "pipe:0",
        "-c:a",
        "aac",
        "-b:a",
        AUDIO_BITRATE,
        "-f",
        "hls",
        "-hls_time",
        HLS_SEGMENT_SECS,
        "-hls_list_size",
        HLS_LIST_SIZE,
        "-hls_flags",
        "delete_segments",
        "-hls_segment_filename",
    ]
    .iter()
    .map(OsString::from)
    .collect();

    args.push(paths.segment_pattern().into_os_string());
    args.push(paths.playlist_path().into_os_string());
    args
}

/// Arguments of the archival MP3 encoder.
///
/// `-y` keeps ffmpeg from prompting on stdin when the file already exists.
pub fn archival_mp3_args(output: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "-y",
        "-f",
        INPUT_FORMAT,
        "-i",
        "pipe:0",
        "-c:a",
        "libmp3lame",
        "-b:a",
        AUDIO_BITRATE,
    ]
    .iter()
    .map(OsString::from)
    .collect();

    args.push(output.as_os_str().to_owned());
    args
}

/// Launcher for the HLS segmenter.
pub fn live_launcher(config: &TranscoderConfig, paths: &PathsConfig) -> CommandLauncher {
    CommandLauncher::new(
        ProcessRole::Live,
        config.ffmpeg_path.clone(),
        live_hls_args(paths),
    )
}

/// Launcher for the archival encoder writing to `output`.
pub fn archival_launcher(config: &TranscoderConfig, output: &Path) -> CommandLauncher {
    CommandLauncher::new(
        ProcessRole::Archival,
        config.ffmpeg_path.clone(),
        archival_mp3_args(output),
    )
}

/// Source of launchers for a session's two transcoders.
pub trait LauncherFactory: Send + Sync {
    /// Launcher for the HLS segmenter.
    fn live(&self) -> Arc<dyn ProcessLauncher>;

    /// Launcher for an archival encoder writing to `output`.
    fn archival(&self, output: &Path) -> Arc<dyn ProcessLauncher>;
}

/// Launches the real ffmpeg binary.
#[derive(Debug, Clone)]
pub struct FfmpegLaunchers {
    transcoder: TranscoderConfig,
    paths: PathsConfig,
}

impl FfmpegLaunchers {
    pub fn new(transcoder: TranscoderConfig, paths: PathsConfig) -> Self {
        Self { transcoder, paths }
    }
}

impl LauncherFactory for FfmpegLaunchers {
    fn live(&self) -> Arc<dyn ProcessLauncher> {
        Arc::new(live_launcher(&self.transcoder, &self.paths))
    }

    fn archival(&self, output: &Path) -> Arc<dyn ProcessLauncher> {
        Arc::new(archival_launcher(&self.transcoder, output))
    }
}
