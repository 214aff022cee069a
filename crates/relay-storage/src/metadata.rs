//! Session metadata records.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use relay_ipc::SessionId;

use crate::error::StorageError;
use crate::StorageResult;

/// Fields written when a session's recording is published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRecord {
    /// Public URL of the archival recording.
    #[serde(rename = "audioURL")]
    pub audio_url: String,

    /// Whether the session is still broadcasting.
    pub is_live: bool,

    /// Time of the update.
    pub updated_at: DateTime<Utc>,
}

impl MetadataRecord {
    /// Record for a finished broadcast.
    pub fn finished(audio_url: impl Into<String>) -> Self {
        Self {
            audio_url: audio_url.into(),
            is_live: false,
            updated_at: Utc::now(),
        }
    }
}

/// Trait for metadata backends.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Merge `record` into the session's document, creating it if missing.
    async fn update_record(&self, session_id: &SessionId, record: &MetadataRecord)
        -> StorageResult<()>;
}

/// Metadata kept in a single JSON file.
///
/// The file holds one object per collection, keyed by session id:
/// `{ "radios": { "<id>": { "audioURL": ..., "isLive": false, ... } } }`.
/// Fields not named in a record are preserved on update.
#[derive(Debug)]
pub struct JsonFileMetadataStore {
    path: PathBuf,
    collection: String,
    write_lock: Mutex<()>,
}

impl JsonFileMetadataStore {
    pub fn new(path: impl Into<PathBuf>, collection: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            collection: collection.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Read a session's document, if present.
    pub async fn document(&self, session_id: &SessionId) -> StorageResult<Option<Value>> {
        let root = self.load().await?;
        Ok(root
            .get(&self.collection)
            .and_then(|c| c.get(session_id.as_str()))
            .cloned())
    }

    async fn load(&self) -> StorageResult<Map<String, Value>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Map::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(StorageError::io(&self.path, e)),
        }
    }

    async fn save(&self, root: &Map<String, Value>) -> StorageResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }

        let data = serde_json::to_vec_pretty(root)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| StorageError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StorageError::io(&self.path, e))
    }
}

#[async_trait]
impl MetadataStore for JsonFileMetadataStore {
    #[instrument(skip(self, record), fields(collection = %self.collection))]
    async fn update_record(
        &self,
        session_id: &SessionId,
        record: &MetadataRecord,
    ) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;

        let mut root = self.load().await?;
        let fields = match serde_json::to_value(record)? {
            Value::Object(fields) => fields,
            _ => return Err(StorageError::Unavailable("record is not an object".to_string())),
        };

        let collection = root
            .entry(self.collection.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !collection.is_object() {
            *collection = Value::Object(Map::new());
        }
        if let Value::Object(documents) = collection {
            let document = documents
                .entry(session_id.as_str().to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !document.is_object() {
                *document = Value::Object(Map::new());
            }
            if let Value::Object(document) = document {
                document.extend(fields);
            }
        }

        self.save(&root).await?;
        debug!(%session_id, "Updated metadata record");
        Ok(())
    }
}
