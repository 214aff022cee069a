//! Producer WebSocket ingress.
//!
//! This crate accepts the single producer connection, turns every frame into
//! a sequenced [`Chunk`](relay_ipc::Chunk) and hands it to a
//! [`ProducerHandler`]. The [`IngressGate`] decides whether a connection is
//! accepted at all.

mod error;
mod gate;
mod handler;
mod ingress;

pub use error::TransportError;
pub use gate::{ConnectionId, ConnectionPermit, GateState, IngressGate};
pub use handler::ProducerHandler;
pub use ingress::{ingress_router, pump_frames, IngressState, INGEST_PATH};

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Chunks between two debug-level chunk logs.
pub const CHUNK_LOG_INTERVAL: u64 = 100;
