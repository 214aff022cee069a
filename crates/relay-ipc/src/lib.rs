//! Typed messages shared between the relay's subsystems.
//!
//! This crate defines the plain-data types passed between the HTTP layer,
//! the session controller, the transcoder supervisors and the event drain.

mod commands;
mod events;
mod state;
mod types;

pub use commands::{EngineCommand, EngineReply};
pub use events::{ProcessEvent, RelayEvent};
pub use state::{DrainReason, SessionState, StartupPhase};
pub use types::{
    Chunk, FinalizeReceipt, PathsConfig, ProcessRole, RelayConfig, RelayMetrics, RoleMetrics,
    ServerConfig, SessionConfig, SessionId, SessionIdError, StorageConfig, TimingConfig,
    TranscoderConfig, HLS_STREAM_KEY, MAX_SESSION_ID_LEN,
};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for commands (HTTP → Engine).
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Channel capacity for events (Engine → observers).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<RelayEvent>, Receiver<RelayEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
