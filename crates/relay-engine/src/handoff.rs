//! Hand-off of a finished recording to the object and metadata stores.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use relay_ipc::SessionId;
use relay_storage::{archival_object_key, MetadataRecord, MetadataStore, ObjectStore};

use crate::error::HandoffError;
use crate::timer::ScheduledTask;

/// Uploads archival files, records their URL and removes the local copy.
pub struct UploadHandoff {
    objects: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    grace: Duration,
    deletions: Arc<Mutex<Deletions>>,
}

/// Local files waiting to be removed, keyed by path.
#[derive(Default)]
struct Deletions {
    next_id: u64,
    pending: HashMap<PathBuf, PendingDeletion>,
    /// Bumped each time a new recording claims the path.
    epochs: HashMap<PathBuf, u64>,
}

struct PendingDeletion {
    id: u64,
    task: ScheduledTask,
}

impl Deletions {
    fn epoch(&self, path: &Path) -> u64 {
        self.epochs.get(path).copied().unwrap_or(0)
    }
}

impl UploadHandoff {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        grace: Duration,
    ) -> Self {
        Self {
            objects,
            metadata,
            grace,
            deletions: Arc::new(Mutex::new(Deletions::default())),
        }
    }

    /// Publish the recording at `path` and return its public URL.
    ///
    /// On success the local file is deleted after the grace delay, unless a
    /// new recording has claimed the path in the meantime. On any error
    /// nothing is deleted.
    #[instrument(name = "handoff", skip(self, path), fields(path = %path.display()))]
    pub async fn finalize(
        &self,
        session_id: &SessionId,
        path: &Path,
    ) -> Result<String, HandoffError> {
        let epoch = self.deletions.lock().epoch(path);

        let data = match tokio::fs::read(path).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(HandoffError::ArtifactNotFound {
                    path: path.to_path_buf(),
                });
            }
            Err(source) => {
                return Err(HandoffError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        debug!(size = data.len(), "Read archival file");

        let key = archival_object_key(session_id);
        let object = self
            .objects
            .upload(&key, data)
            .await
            .map_err(HandoffError::Upload)?;
        let audio_url = self
            .objects
            .public_url(&object)
            .await
            .map_err(HandoffError::PublicUrl)?;

        self.metadata
            .update_record(session_id, &MetadataRecord::finished(audio_url.clone()))
            .await
            .map_err(HandoffError::Metadata)?;

        info!(%audio_url, "Recording published");
        self.schedule_deletion(path.to_path_buf(), epoch);

        Ok(audio_url)
    }

    /// Claim `path` for a new recording.
    ///
    /// A deletion still waiting on its grace delay is carried out now, since
    /// its upload already succeeded. Uploads still in flight for the path
    /// will not schedule one.
    #[instrument(name = "reclaim_path", skip(self, path), fields(path = %path.display()))]
    pub fn reclaim(&self, path: &Path) {
        let mut deletions = self.deletions.lock();
        *deletions.epochs.entry(path.to_path_buf()).or_default() += 1;

        if let Some(pending) = deletions.pending.remove(path) {
            pending.task.cancel();
            debug!("Removing published recording before reuse");
            remove_recording(path);
        }
    }

    fn schedule_deletion(&self, path: PathBuf, epoch: u64) {
        let mut deletions = self.deletions.lock();
        if deletions.epoch(&path) != epoch {
            info!(path = %path.display(), "Path reused by a newer recording, keeping it");
            return;
        }

        deletions.next_id += 1;
        let id = deletions.next_id;
        let shared = Arc::clone(&self.deletions);
        let target = path.clone();
        let task = ScheduledTask::after("delete_archival", self.grace, async move {
            expire(&shared, &target, id);
        });

        // Replacing an older entry for the same path cancels it.
        deletions.pending.insert(path, PendingDeletion { id, task });
    }

    /// Deletions not yet carried out.
    pub fn pending_deletions(&self) -> usize {
        self.deletions.lock().pending.len()
    }
}

/// Run deletion `id` unless it was cancelled or replaced.
fn expire(deletions: &Mutex<Deletions>, path: &Path, id: u64) {
    let mut deletions = deletions.lock();
    if deletions.pending.get(path).is_some_and(|p| p.id == id) {
        remove_recording(path);
        // Dropping the entry aborts this task, which has no await left.
        deletions.pending.remove(path);
    }
}

fn remove_recording(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "Deleted local recording"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Local recording already gone");
        }
        Err(e) => warn!(path = %path.display(), "Failed to delete local recording: {}", e),
    }
}
