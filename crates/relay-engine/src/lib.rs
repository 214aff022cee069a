//! Session controller for the relay.
//!
//! This crate ties the producer ingress, the two transcoder supervisors and
//! the upload handoff together into one session lifecycle.

mod error;
mod handoff;
mod metrics;
mod orchestrator;
mod pipeline;
mod state;
mod timer;

pub use error::{EngineError, HandoffError};
pub use handoff::UploadHandoff;
pub use metrics::{MetricsCollector, SessionStats};
pub use orchestrator::{Engine, EngineHandle};
pub use pipeline::{Dispatch, RelayPipeline, SessionTaps};
pub use state::SessionResources;
pub use timer::ScheduledTask;

use std::sync::Arc;

use crossbeam_channel::Sender;
use relay_ipc::{RelayConfig, RelayEvent};
use relay_storage::{MetadataStore, ObjectStore};
use relay_transcoder::LauncherFactory;

/// Result type for engine requests.
pub type EngineResult<T> = Result<T, EngineError>;

/// Create an engine and its handle.
pub fn create_engine(
    config: RelayConfig,
    launchers: Arc<dyn LauncherFactory>,
    objects: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    event_tx: Sender<RelayEvent>,
) -> (Engine, EngineHandle) {
    let handoff = UploadHandoff::new(objects, metadata, config.timing.grace_delay());
    Engine::new(config, launchers, handoff, event_tx)
}
