//! Relay server library.

pub mod config;
pub mod handlers;

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_engine::create_engine;
use relay_ipc::{event_channel, PathsConfig, RelayConfig, RelayEvent, SessionId};
use relay_storage::{JsonFileMetadataStore, LocalObjectStore};
use relay_transcoder::FfmpegLaunchers;

pub use handlers::{router, AppState};

/// Filter used when neither `RUST_LOG` nor a configured level is set.
pub const DEFAULT_LOG_DIRECTIVES: &str = "relay=debug,relay_lib=debug,relay_engine=debug,relay_transcoder=debug,relay_transport=debug,relay_storage=debug,tower_http=info";

/// Initialize logging.
pub fn init_logging(log_level: Option<&str>) {
    let fallback = log_level.unwrap_or(DEFAULT_LOG_DIRECTIVES).to_string();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Create the output directories.
pub fn prepare_directories(paths: &PathsConfig) -> Result<()> {
    let metadata_dir = paths
        .metadata_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty());

    for dir in [&paths.hls_dir, &paths.archive_dir, &paths.object_root]
        .into_iter()
        .map(|p| p.as_path())
        .chain(metadata_dir)
    {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        debug!(dir = %dir.display(), "Directory ready");
    }
    Ok(())
}

/// Run the relay until SIGINT or SIGTERM.
pub async fn run(config: RelayConfig) -> Result<()> {
    info!("Relay starting");
    prepare_directories(&config.paths)?;

    let objects = Arc::new(
        LocalObjectStore::new(&config.paths.object_root, &config.storage.public_base_url)
            .context("Failed to initialize object store")?,
    );
    let metadata = Arc::new(JsonFileMetadataStore::new(
        &config.paths.metadata_file,
        config.storage.collection.clone(),
    ));
    let launchers = Arc::new(FfmpegLaunchers::new(
        config.transcoder.clone(),
        config.paths.clone(),
    ));

    let (event_tx, event_rx) = event_channel();
    spawn_event_logger(event_rx).context("Failed to spawn event logger")?;

    let (engine, handle) = create_engine(config.clone(), launchers, objects, metadata, event_tx);
    let engine_task = engine.spawn();

    if let Some(raw) = &config.session.auto_start {
        let session_id = SessionId::new(raw.clone()).context("Invalid auto_start session id")?;
        handle
            .start(session_id)
            .await
            .context("Failed to start the boot session")?;
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let app = router(AppState {
        engine: handle.clone(),
        config: Arc::new(config),
    });

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Relay ready on http://{}", addr);
    info!("   Producer: ws://{}{}", addr, relay_transport::INGEST_PATH);
    info!("   Finalize: POST http://{}/upload-audio", addr);
    info!("   Live: http://{}/hls/{}.m3u8", addr, relay_ipc::HLS_STREAM_KEY);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Err(e) = handle.shutdown().await {
        warn!("Engine shutdown failed: {}", e);
    }
    if let Err(e) = engine_task.await {
        warn!("Engine task failed: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

/// Log engine events on a dedicated thread.
fn spawn_event_logger(events: Receiver<RelayEvent>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("relay-events".to_string())
        .spawn(move || {
            for event in events.iter() {
                log_event(&event);
            }
            debug!("Event channel closed");
        })
}

fn log_event(event: &RelayEvent) {
    match event {
        RelayEvent::StateChanged { previous, current } => {
            info!(from = previous.name(), to = current.name(), "Session state changed");
        }
        RelayEvent::Process(process) => debug!(role = %process.role(), ?process, "Transcoder event"),
        RelayEvent::ProducerConnected { session_id } => info!(%session_id, "Producer connected"),
        RelayEvent::ProducerDisconnected { session_id, reason } => {
            info!(%session_id, reason = %reason.message(), "Producer disconnected");
        }
        RelayEvent::Finalized {
            session_id,
            audio_url,
        } => info!(%session_id, %audio_url, "Recording published"),
        RelayEvent::FinalizeFailed {
            session_id,
            message,
        } => warn!(%session_id, %message, "Finalize failed"),
        RelayEvent::Metrics(metrics) => debug!(
            chunks = metrics.chunks_received,
            bytes = metrics.bytes_received,
            live_dropped = metrics.live.chunks_dropped,
            archival_dropped = metrics.archival.chunks_dropped,
            live_restarts = metrics.live.restarts,
            uptime = metrics.uptime_seconds,
            "Relay metrics"
        ),
        RelayEvent::Ready => info!("Engine ready"),
        RelayEvent::Shutdown => info!("Engine shut down"),
    }
}

async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_prepare_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let paths = PathsConfig {
            hls_dir: root.join("out/hls"),
            archive_dir: root.join("out/mp3"),
            object_root: root.join("objects"),
            metadata_file: root.join("db/metadata.json"),
        };

        prepare_directories(&paths).unwrap();

        for dir in ["out/hls", "out/mp3", "objects", "db"] {
            assert!(root.join(dir).is_dir(), "{dir} missing");
        }
        assert!(!root.join("db/metadata.json").exists());
    }

    #[test]
    fn test_bare_metadata_file_needs_no_parent() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathsConfig {
            hls_dir: dir.path().join("hls"),
            archive_dir: dir.path().join("mp3"),
            object_root: dir.path().join("objects"),
            metadata_file: PathBuf::from("metadata.json"),
        };

        prepare_directories(&paths).unwrap();
    }
}
