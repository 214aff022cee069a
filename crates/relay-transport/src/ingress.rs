//! WebSocket endpoint for the producer.

use std::fmt;
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::{debug, info, trace, warn};

use relay_ipc::{Chunk, DrainReason};

use crate::error::TransportError;
use crate::gate::{ConnectionPermit, IngressGate};
use crate::handler::ProducerHandler;
use crate::CHUNK_LOG_INTERVAL;

/// Path of the producer endpoint. The root path is accepted as well.
pub const INGEST_PATH: &str = "/ingest";

/// Shared state of the ingress routes.
#[derive(Clone)]
pub struct IngressState {
    gate: IngressGate,
    handler: Arc<dyn ProducerHandler>,
}

impl IngressState {
    pub fn new(gate: IngressGate, handler: Arc<dyn ProducerHandler>) -> Self {
        Self { gate, handler }
    }
}

/// Routes accepting the producer WebSocket.
pub fn ingress_router(state: IngressState) -> Router {
    Router::new()
        .route(INGEST_PATH, get(ingest))
        .route("/", get(ingest))
        .with_state(state)
}

impl IntoResponse for TransportError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::NotAccepting => StatusCode::SERVICE_UNAVAILABLE,
            Self::AlreadyConnected => StatusCode::CONFLICT,
            Self::ConnectionLost(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

async fn ingest(
    State(ingress): State<IngressState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    // The slot is claimed before upgrading so refused producers get a status code.
    let permit = match ingress.gate.try_claim() {
        Ok(permit) => permit,
        Err(e) => {
            debug!("Refused producer: {}", e);
            return e.into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let handler = Arc::clone(&ingress.handler);
    ws.on_upgrade(move |socket| async move {
        pump_frames(socket, permit, handler.as_ref()).await;
    })
}

/// Drive one producer connection to completion.
///
/// Every binary or text frame becomes a chunk, numbered from zero. A close
/// frame, the end of the stream or a stream error ends the connection and
/// closes the gate before `on_disconnect` is called. If the gate is closed
/// from outside, the connection is dropped without `on_disconnect`.
pub async fn pump_frames<S, E>(frames: S, mut permit: ConnectionPermit, handler: &dyn ProducerHandler)
where
    S: Stream<Item = Result<Message, E>>,
    E: fmt::Display,
{
    futures::pin_mut!(frames);
    let connection = permit.id();

    info!(%connection, "Producer connected");
    handler.on_connect(connection);

    let mut sequence = 0u64;
    let reason = loop {
        let frame = tokio::select! {
            _ = permit.closed() => {
                info!(%connection, "Ingress closed, dropping producer");
                return;
            }
            frame = frames.next() => frame,
        };

        let data = match frame {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_str().as_bytes()),
            Some(Ok(Message::Close(_))) | None => break DrainReason::ProducerLeft,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                let error = TransportError::ConnectionLost(e.to_string());
                warn!(%connection, "Producer connection failed: {}", error);
                handler.on_error(connection, &error);
                break DrainReason::ConnectionError {
                    message: e.to_string(),
                };
            }
        };

        if sequence % CHUNK_LOG_INTERVAL == 0 {
            debug!(%connection, sequence, size = data.len(), "Chunk received");
        } else {
            trace!(%connection, sequence, size = data.len(), "Chunk received");
        }

        handler.on_chunk(connection, Chunk::new(sequence, data));
        sequence += 1;
    };

    permit.close_gate();
    info!(%connection, chunks = sequence, reason = %reason.message(), "Producer disconnected");
    handler.on_disconnect(connection, reason);
}
