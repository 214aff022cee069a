//! Session state machine types.

use serde::{Deserialize, Serialize};

use crate::types::SessionId;

/// The lifecycle state of the single live session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No session.
    #[default]
    Idle,

    /// Transcoders are running, ingress is waiting for the warm-up delay.
    Starting {
        /// Session being started.
        session_id: SessionId,

        /// Current startup phase.
        phase: StartupPhase,
    },

    /// Ingress is open.
    Active {
        /// Session being broadcast.
        session_id: SessionId,

        /// Whether a producer is currently streaming.
        producer_connected: bool,
    },

    /// The producer left; the archival encoder is flushing.
    Draining {
        /// Session that ended.
        session_id: SessionId,

        /// Why the session ended.
        reason: DrainReason,
    },

    /// The archival file is being uploaded.
    Finalizing {
        /// Session being finalized.
        session_id: SessionId,
    },
}

impl SessionState {
    /// Returns true if no session exists.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns true while the ingress is waiting for warm-up.
    pub fn is_starting(&self) -> bool {
        matches!(self, Self::Starting { .. })
    }

    /// Returns true if the ingress is open.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    /// Returns true if the session ended and awaits finalize.
    pub fn is_draining(&self) -> bool {
        matches!(self, Self::Draining { .. })
    }

    /// Returns true while an upload is in flight.
    pub fn is_finalizing(&self) -> bool {
        matches!(self, Self::Finalizing { .. })
    }

    /// The session this state refers to, if any.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Idle => None,
            Self::Starting { session_id, .. }
            | Self::Active { session_id, .. }
            | Self::Draining { session_id, .. }
            | Self::Finalizing { session_id } => Some(session_id),
        }
    }

    /// Returns a simple string representation of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Starting { .. } => "Starting",
            Self::Active { .. } => "Active",
            Self::Draining { .. } => "Draining",
            Self::Finalizing { .. } => "Finalizing",
        }
    }
}

/// Startup phases of a session, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartupPhase {
    /// Spawning the HLS transcoder.
    SpawnLive,

    /// Spawning the archival transcoder.
    SpawnArchival,

    /// Letting the segmenter build a buffer before clients arrive.
    WarmUp,

    /// Opening the producer endpoint.
    OpenIngress,
}

/// Reason a session left the Active state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrainReason {
    /// The producer closed the connection.
    ProducerLeft,

    /// The connection failed.
    ConnectionError { message: String },

    /// A new session was started.
    Superseded,

    /// The engine is shutting down.
    Shutdown,
}

impl DrainReason {
    /// Returns a display message for this reason.
    pub fn message(&self) -> String {
        match self {
            Self::ProducerLeft => "Producer disconnected".to_string(),
            Self::ConnectionError { message } => format!("Connection error: {message}"),
            Self::Superseded => "Superseded by a new session".to_string(),
            Self::Shutdown => "Relay shutting down".to_string(),
        }
    }
}
