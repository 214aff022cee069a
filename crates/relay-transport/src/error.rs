//! Error types for the transport module.

use thiserror::Error;

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No session is ready for a producer.
    #[error("Ingress is not accepting producers")]
    NotAccepting,

    /// Another producer holds the connection slot.
    #[error("A producer is already connected")]
    AlreadyConnected,

    /// The connection failed while streaming.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}
