//! Commands sent to the session controller, and its replies.

use serde::{Deserialize, Serialize};

use crate::state::{DrainReason, SessionState};
use crate::types::{FinalizeReceipt, RelayMetrics, SessionId};

/// Commands that the HTTP layer and the ingress can send to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineCommand {
    /// Start a new session, superseding any session in progress.
    Start { session_id: SessionId },

    /// A producer passed the ingress gate of session `generation`.
    ProducerConnected { generation: u64 },

    /// The producer of session `generation` left, cleanly or through a
    /// connection error.
    ProducerDisconnected { generation: u64, reason: DrainReason },

    /// Upload the archival file of a finished session.
    Finalize { session_id: SessionId },

    /// Request a snapshot of the current state.
    GetState,

    /// Tear down any session and stop the engine.
    Shutdown,
}

impl EngineCommand {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::ProducerConnected { .. } => "producer_connected",
            Self::ProducerDisconnected { .. } => "producer_disconnected",
            Self::Finalize { .. } => "finalize",
            Self::GetState => "get_state",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Successful replies to an [`EngineCommand`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineReply {
    /// The command was applied; carries the state after the transition.
    Accepted(SessionState),

    /// Current state and metrics.
    Snapshot {
        state: SessionState,
        metrics: RelayMetrics,
    },

    /// The archival file was uploaded and recorded.
    Finalized(FinalizeReceipt),
}
