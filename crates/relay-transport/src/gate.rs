//! Ingress gate state management.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::error::TransportError;
use crate::TransportResult;

/// Identifier of one accepted producer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State of the ingress gate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateState {
    /// Producers are refused.
    #[default]
    Closed,

    /// The next producer is accepted.
    Open,

    /// A producer holds the connection slot.
    Connected { connection: ConnectionId },
}

impl GateState {
    /// Check if a producer would be accepted.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Check if a producer is connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

struct GateInner {
    state: RwLock<GateState>,
    next_id: AtomicU64,
    closed: watch::Sender<u64>,
}

/// Open/closed switch plus the single producer slot.
#[derive(Clone)]
pub struct IngressGate {
    inner: Arc<GateInner>,
}

impl Default for IngressGate {
    fn default() -> Self {
        Self::new()
    }
}

impl IngressGate {
    /// Create a closed gate.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GateInner {
                state: RwLock::new(GateState::Closed),
                next_id: AtomicU64::new(1),
                closed: watch::Sender::new(0),
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> GateState {
        self.inner.state.read().clone()
    }

    /// Start accepting a producer. Keeps an existing connection.
    pub fn open(&self) {
        let mut state = self.inner.state.write();
        if *state == GateState::Closed {
            debug!("Ingress gate opened");
            *state = GateState::Open;
        }
    }

    /// Refuse producers and disconnect the connected one, if any.
    pub fn close(&self) {
        let previous = std::mem::take(&mut *self.inner.state.write());
        if previous != GateState::Closed {
            debug!(?previous, "Ingress gate closed");
        }
        if previous.is_connected() {
            self.inner.closed.send_modify(|epoch| *epoch += 1);
        }
    }

    /// Take the producer slot.
    pub fn try_claim(&self) -> TransportResult<ConnectionPermit> {
        let mut state = self.inner.state.write();
        match *state {
            GateState::Closed => Err(TransportError::NotAccepting),
            GateState::Connected { .. } => Err(TransportError::AlreadyConnected),
            GateState::Open => {
                let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
                *state = GateState::Connected { connection: id };
                Ok(ConnectionPermit {
                    gate: self.clone(),
                    id,
                    closed: self.inner.closed.subscribe(),
                })
            }
        }
    }
}

/// Holds the producer slot; releases it when dropped.
pub struct ConnectionPermit {
    gate: IngressGate,
    id: ConnectionId,
    closed: watch::Receiver<u64>,
}

impl ConnectionPermit {
    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Close the gate as this connection ends, without notifying it.
    pub fn close_gate(&self) {
        let mut state = self.gate.inner.state.write();
        if *state == (GateState::Connected { connection: self.id }) {
            *state = GateState::Closed;
        }
    }

    /// Resolves once the gate is closed under this connection.
    pub async fn closed(&mut self) {
        // The sender lives in the gate this permit keeps alive.
        let _ = self.closed.changed().await;
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        let mut state = self.gate.inner.state.write();
        if *state == (GateState::Connected { connection: self.id }) {
            *state = GateState::Open;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_gate_refuses() {
        let gate = IngressGate::new();

        assert!(matches!(gate.try_claim(), Err(TransportError::NotAccepting)));
    }

    #[test]
    fn test_single_producer_slot() {
        let gate = IngressGate::new();
        gate.open();

        let permit = gate.try_claim().unwrap();
        assert!(gate.state().is_connected());
        assert!(matches!(gate.try_claim(), Err(TransportError::AlreadyConnected)));

        drop(permit);
        assert!(gate.state().is_open());
        assert!(gate.try_claim().is_ok());
    }

    #[test]
    fn test_release_after_close_keeps_gate_closed() {
        let gate = IngressGate::new();
        gate.open();
        let permit = gate.try_claim().unwrap();

        gate.close();
        drop(permit);

        assert_eq!(gate.state(), GateState::Closed);
    }

    #[test]
    fn test_open_keeps_connection() {
        let gate = IngressGate::new();
        gate.open();
        let permit = gate.try_claim().unwrap();

        gate.open();

        assert_eq!(
            gate.state(),
            GateState::Connected {
                connection: permit.id()
            }
        );
    }

    #[tokio::test]
    async fn test_close_notifies_connection() {
        let gate = IngressGate::new();
        gate.open();
        let mut permit = gate.try_claim().unwrap();

        gate.close();

        tokio::time::timeout(std::time::Duration::from_secs(1), permit.closed())
            .await
            .unwrap();
    }
}
