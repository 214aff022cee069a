//! Object storage.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, instrument};
use url::Url;

use relay_ipc::SessionId;

use crate::error::StorageError;
use crate::StorageResult;

/// Folder that receives archival recordings.
const AUDIO_PREFIX: &str = "audios";

/// Object key of a session's archival recording.
pub fn archival_object_key(session_id: &SessionId) -> String {
    format!("{AUDIO_PREFIX}/live-stream-{}.mp3", session_id.file_stem())
}

/// Reference to a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    /// Key the object was stored under.
    pub key: String,

    /// Stored size in bytes.
    pub size: u64,
}

/// Trait for object storage backends.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `key`, replacing any previous object.
    async fn upload(&self, key: &str, data: Bytes) -> StorageResult<ObjectRef>;

    /// Publicly resolvable URL of a stored object.
    async fn public_url(&self, object: &ObjectRef) -> StorageResult<String>;
}

/// Object store on the local filesystem, published under a base URL.
///
/// Layout:
/// ```text
/// {root}/
/// └── audios/
///     └── live-stream-<id>.mp3
/// ```
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    base_url: Url,
}

impl LocalObjectStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>, public_base_url: &str) -> StorageResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| StorageError::io(&root, e))?;

        // Url::join replaces the last segment unless the base ends with a slash.
        let base_url = if public_base_url.ends_with('/') {
            Url::parse(public_base_url)?
        } else {
            Url::parse(&format!("{public_base_url}/"))?
        };

        Ok(Self { root, base_url })
    }

    /// Path where an object would be stored.
    pub fn object_path(&self, key: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    #[instrument(skip(self, data), fields(size = data.len()))]
    async fn upload(&self, key: &str, data: Bytes) -> StorageResult<ObjectRef> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }

        // Write next to the target and rename so readers never see a partial object.
        let partial = path.with_extension("partial");
        tokio::fs::write(&partial, &data)
            .await
            .map_err(|e| StorageError::io(&partial, e))?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| StorageError::io(&path, e))?;

        debug!(path = %path.display(), "Stored object");

        Ok(ObjectRef {
            key: key.to_string(),
            size: data.len() as u64,
        })
    }

    async fn public_url(&self, object: &ObjectRef) -> StorageResult<String> {
        Ok(self.base_url.join(&object.key)?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archival_key_uses_escaped_id() {
        let id = SessionId::new("radio/7").unwrap();
        assert_eq!(archival_object_key(&id), "audios/live-stream-radio~2F7.mp3");

        let spaced = archival_object_key(&SessionId::new("radio a").unwrap());
        let underscored = archival_object_key(&SessionId::new("radio_a").unwrap());
        assert_ne!(spaced, underscored);
    }

    #[tokio::test]
    async fn test_upload_writes_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "http://localhost:5001/objects").unwrap();

        let object = store
            .upload("audios/live-stream-a.mp3", Bytes::from_static(b"mp3"))
            .await
            .unwrap();

        assert_eq!(object.size, 3);
        assert_eq!(
            std::fs::read(dir.path().join("audios/live-stream-a.mp3")).unwrap(),
            b"mp3"
        );
        assert!(!dir.path().join("audios/live-stream-a.partial").exists());
    }

    #[tokio::test]
    async fn test_upload_replaces_existing_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "http://localhost/").unwrap();

        store.upload("a.mp3", Bytes::from_static(b"old")).await.unwrap();
        store.upload("a.mp3", Bytes::from_static(b"new")).await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("a.mp3")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_public_url_keeps_escaped_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "http://localhost:5001/objects/").unwrap();
        let object = ObjectRef {
            key: archival_object_key(&SessionId::new("radio a").unwrap()),
            size: 0,
        };

        assert_eq!(
            store.public_url(&object).await.unwrap(),
            "http://localhost:5001/objects/audios/live-stream-radio~20a.mp3"
        );
    }

    #[tokio::test]
    async fn test_public_url_joins_base() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "https://cdn.example.com/objects").unwrap();
        let object = ObjectRef {
            key: "audios/live-stream-a.mp3".to_string(),
            size: 0,
        };

        assert_eq!(
            store.public_url(&object).await.unwrap(),
            "https://cdn.example.com/objects/audios/live-stream-a.mp3"
        );
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "http://localhost/").unwrap();

        for key in ["", "../x.mp3", "/etc/passwd", "audios/../../x"] {
            assert!(matches!(
                store.upload(key, Bytes::new()).await,
                Err(StorageError::InvalidKey(_))
            ));
        }
    }

    #[test]
    fn test_invalid_base_url() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            LocalObjectStore::new(dir.path(), "not a url"),
            Err(StorageError::Url(_))
        ));
    }
}
