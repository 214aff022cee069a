//! Receiver side of the producer connection.

use relay_ipc::{Chunk, DrainReason};

use crate::error::TransportError;
use crate::gate::ConnectionId;

/// Callbacks driven by a producer connection, in order: one `on_connect`,
/// any number of `on_chunk`, then `on_disconnect` unless the gate closed the
/// connection itself.
///
/// Called from the connection task; implementations must not block.
pub trait ProducerHandler: Send + Sync {
    /// A producer was accepted.
    fn on_connect(&self, connection: ConnectionId);

    /// A frame arrived.
    fn on_chunk(&self, connection: ConnectionId, chunk: Chunk);

    /// The producer went away.
    fn on_disconnect(&self, connection: ConnectionId, reason: DrainReason);

    /// The connection failed. A disconnect follows.
    fn on_error(&self, connection: ConnectionId, error: &TransportError);
}
