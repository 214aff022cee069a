//! Events sent from the engine to observers.

use serde::{Deserialize, Serialize};

use crate::state::{DrainReason, SessionState};
use crate::types::{ProcessRole, RelayMetrics, SessionId};

/// Events that the engine emits while running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RelayEvent {
    /// Session state has changed.
    StateChanged {
        /// Previous state.
        previous: Box<SessionState>,

        /// Current state.
        current: Box<SessionState>,
    },

    /// A transcoder process changed state.
    Process(ProcessEvent),

    /// A producer connected to the ingress.
    ProducerConnected { session_id: SessionId },

    /// The producer left.
    ProducerDisconnected {
        session_id: SessionId,
        reason: DrainReason,
    },

    /// The archival file was uploaded.
    Finalized {
        session_id: SessionId,
        audio_url: String,
    },

    /// Finalize failed.
    FinalizeFailed {
        session_id: SessionId,
        message: String,
    },

    /// Periodic metrics snapshot.
    Metrics(RelayMetrics),

    /// Engine is ready to accept commands.
    Ready,

    /// Engine has shut down.
    Shutdown,
}

/// Lifecycle events of a supervised transcoder process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessEvent {
    /// A new process instance is running.
    Spawned {
        role: ProcessRole,
        instance: u64,
        pid: Option<u32>,
    },

    /// The process could not be launched.
    SpawnFailed { role: ProcessRole, reason: String },

    /// A process instance exited.
    Exited {
        role: ProcessRole,
        instance: u64,
        code: Option<i32>,
        intentional: bool,
    },

    /// The supervisor is about to start a replacement instance.
    Restarting {
        role: ProcessRole,
        attempt: u32,
        delay_ms: u64,
    },
}

impl ProcessEvent {
    /// The role of the process this event is about.
    pub fn role(&self) -> ProcessRole {
        match self {
            Self::Spawned { role, .. }
            | Self::SpawnFailed { role, .. }
            | Self::Exited { role, .. }
            | Self::Restarting { role, .. } => *role,
        }
    }
}
