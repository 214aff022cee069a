//! HTTP routes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

use relay_engine::{EngineError, EngineHandle};
use relay_ipc::{RelayConfig, RelayMetrics, SessionId, SessionIdError, SessionState};
use relay_transport::ingress_router;

/// State shared by the HTTP routes.
#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub config: Arc<RelayConfig>,
}

/// All routes: API, static output directories and the producer WebSocket.
pub fn router(state: AppState) -> Router {
    let paths = &state.config.paths;
    let ingress = ingress_router(state.engine.ingress());

    Router::new()
        .route("/upload-audio", post(upload_audio))
        .route("/sessions", post(start_session))
        .route("/status", get(status))
        .nest_service("/hls", ServeDir::new(&paths.hls_dir))
        .nest_service("/mp3", ServeDir::new(&paths.archive_dir))
        .nest_service("/objects", ServeDir::new(&paths.object_root))
        .with_state(state.clone())
        .merge(ingress)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub radio_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageBody {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadBody {
    pub message: String,
    #[serde(rename = "audioURL")]
    pub audio_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusBody {
    pub state: SessionState,
    pub metrics: RelayMetrics,
}

/// Failure of an API request.
#[derive(Debug)]
pub enum ApiError {
    InvalidSessionId(SessionIdError),
    Engine(EngineError),
}

impl From<SessionIdError> for ApiError {
    fn from(e: SessionIdError) -> Self {
        Self::InvalidSessionId(e)
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::InvalidSessionId(e) => (StatusCode::BAD_REQUEST, format!("Invalid radioId: {e}")),
            Self::Engine(e) if e.is_missing_artifact() => {
                (StatusCode::BAD_REQUEST, "Audio file not found".to_string())
            }
            Self::Engine(e @ EngineError::Busy { .. }) => (StatusCode::CONFLICT, e.to_string()),
            Self::Engine(e) => {
                error!("Request failed: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(MessageBody { message })).into_response()
    }
}

/// Publish the recording of a finished session.
#[instrument(skip(state))]
async fn upload_audio(
    State(state): State<AppState>,
    Json(request): Json<SessionRequest>,
) -> Result<Json<UploadBody>, ApiError> {
    let session_id = SessionId::new(request.radio_id)?;
    let receipt = state.engine.finalize(session_id).await?;

    info!(session_id = %receipt.session_id, audio_url = %receipt.audio_url, "Recording uploaded");
    Ok(Json(UploadBody {
        message: "Audio uploaded and radio document updated successfully".to_string(),
        audio_url: receipt.audio_url,
    }))
}

/// Start a session, replacing the current one.
#[instrument(skip(state))]
async fn start_session(
    State(state): State<AppState>,
    Json(request): Json<SessionRequest>,
) -> Result<(StatusCode, Json<SessionState>), ApiError> {
    let session_id = SessionId::new(request.radio_id)?;
    let state = state.engine.start(session_id).await?;
    Ok((StatusCode::ACCEPTED, Json(state)))
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusBody>, ApiError> {
    let (state, metrics) = state.engine.snapshot().await?;
    Ok(Json(StatusBody { state, metrics }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use relay_engine::create_engine;
    use relay_storage::memory::{MemoryMetadataStore, MemoryObjectStore};
    use relay_transcoder::testing::FakeLaunchers;
    use tower::ServiceExt;

    struct TestApp {
        dir: tempfile::TempDir,
        config: RelayConfig,
        app: Router,
        metadata: Arc<MemoryMetadataStore>,
        objects: Arc<MemoryObjectStore>,
    }

    fn test_app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RelayConfig::default();
        config.paths.hls_dir = dir.path().join("hls");
        config.paths.archive_dir = dir.path().join("mp3");
        config.paths.object_root = dir.path().join("objects");
        for path in [&config.paths.hls_dir, &config.paths.archive_dir] {
            std::fs::create_dir_all(path).unwrap();
        }
        config.timing.grace_secs = 0;

        let objects = Arc::new(MemoryObjectStore::new("https://store.test/"));
        let metadata = Arc::new(MemoryMetadataStore::new());
        let (event_tx, _events) = crossbeam_channel::unbounded();
        let (engine, handle) = create_engine(
            config.clone(),
            FakeLaunchers::new(),
            objects.clone(),
            metadata.clone(),
            event_tx,
        );
        engine.spawn();

        let app = router(AppState {
            engine: handle,
            config: Arc::new(config.clone()),
        });

        TestApp {
            dir,
            config,
            app,
            metadata,
            objects,
        }
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body<T: for<'de> Deserialize<'de>>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn write_recording(t: &TestApp, id: &str) {
        let path = t.config.paths.archival_path(&SessionId::new(id).unwrap());
        std::fs::write(path, b"mp3").unwrap();
    }

    #[tokio::test]
    async fn test_upload_missing_file_is_bad_request() {
        let t = test_app();

        let response = t
            .app
            .oneshot(post_json("/upload-audio", r#"{"radioId":"r1"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: MessageBody = json_body(response).await;
        assert_eq!(body.message, "Audio file not found");
        assert_eq!(t.objects.uploads(), 0);
    }

    #[tokio::test]
    async fn test_upload_returns_audio_url() {
        let t = test_app();
        write_recording(&t, "r1");

        let response = t
            .app
            .oneshot(post_json("/upload-audio", r#"{"radioId":"r1"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: UploadBody = json_body(response).await;
        assert_eq!(body.audio_url, "https://store.test/audios/live-stream-r1.mp3");
        assert_eq!(t.metadata.updates(), 1);
    }

    #[tokio::test]
    async fn test_metadata_failure_is_internal_error() {
        let t = test_app();
        write_recording(&t, "r1");
        t.metadata.set_failing(true);

        let response = t
            .app
            .oneshot(post_json("/upload-audio", r#"{"radioId":"r1"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: MessageBody = json_body(response).await;
        assert_eq!(body.message, "Internal server error");
    }

    #[tokio::test]
    async fn test_blank_radio_id_is_bad_request() {
        let t = test_app();

        let response = t
            .app
            .oneshot(post_json("/upload-audio", r#"{"radioId":"  "}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upload_while_starting_is_conflict() {
        let t = test_app();

        let response = t
            .app
            .clone()
            .oneshot(post_json("/sessions", r#"{"radioId":"r1"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let state: SessionState = json_body(response).await;
        assert!(state.is_starting());

        let response = t
            .app
            .oneshot(post_json("/upload-audio", r#"{"radioId":"r1"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_status_and_closed_ingress() {
        let t = test_app();

        let response = t
            .app
            .clone()
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: StatusBody = json_body(response).await;
        assert_eq!(body.state, SessionState::Idle);

        let response = t
            .app
            .oneshot(Request::get("/ingest").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_serves_archive_directory() {
        let t = test_app();
        std::fs::write(t.dir.path().join("mp3/take.mp3"), b"mp3").unwrap();

        let response = t
            .app
            .oneshot(Request::get("/mp3/take.mp3").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
