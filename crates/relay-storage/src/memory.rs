//! In-memory stores for tests and local experiments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use relay_ipc::SessionId;

use crate::error::StorageError;
use crate::metadata::{MetadataRecord, MetadataStore};
use crate::object::{ObjectRef, ObjectStore};
use crate::StorageResult;

/// Object store holding everything in a map.
#[derive(Debug)]
pub struct MemoryObjectStore {
    base_url: String,
    objects: Mutex<HashMap<String, Bytes>>,
    uploads: AtomicUsize,
    fail: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            objects: Mutex::new(HashMap::new()),
            uploads: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    /// Make every following upload fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Upload attempts so far, failed ones included.
    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// A stored object.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().get(key).cloned()
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new("memory://objects/")
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(&self, key: &str, data: Bytes) -> StorageResult<ObjectRef> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("upload rejected".to_string()));
        }

        let size = data.len() as u64;
        self.objects.lock().insert(key.to_string(), data);
        Ok(ObjectRef {
            key: key.to_string(),
            size,
        })
    }

    async fn public_url(&self, object: &ObjectRef) -> StorageResult<String> {
        Ok(format!("{}{}", self.base_url, object.key))
    }
}

/// Metadata store holding the latest record per session.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    records: Mutex<HashMap<SessionId, MetadataRecord>>,
    updates: AtomicUsize,
    fail: AtomicBool,
    delay_ms: AtomicU64,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following update fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Hold every following update for `delay` before it lands.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Update attempts so far, failed ones included.
    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// The record stored for a session.
    pub fn record(&self, session_id: &SessionId) -> Option<MetadataRecord> {
        self.records.lock().get(session_id).cloned()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn update_record(
        &self,
        session_id: &SessionId,
        record: &MetadataRecord,
    ) -> StorageResult<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("metadata write rejected".to_string()));
        }

        self.records.lock().insert(session_id.clone(), record.clone());
        Ok(())
    }
}
