//! Helpers shared by the integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use file_server::object_store::{LocalStore, ObjectStore, ObjectStoreError};
use file_server::storage::{StorageEngine, FILES_DIR, SNAPSHOT_FILE};

/// A local store that sleeps before each call, so tests can hold an
/// operation in flight.
pub struct SlowStore {
    inner: LocalStore,
    get_delay: Duration,
    put_delay: Duration,
    delete_delay: Duration,
}

impl SlowStore {
    pub fn new(base_path: &Path) -> Self {
        Self {
            inner: LocalStore::new(base_path).unwrap(),
            get_delay: Duration::ZERO,
            put_delay: Duration::ZERO,
            delete_delay: Duration::ZERO,
        }
    }

    pub fn get_delay(mut self, delay: Duration) -> Self {
        self.get_delay = delay;
        self
    }

    pub fn put_delay(mut self, delay: Duration) -> Self {
        self.put_delay = delay;
        self
    }

    pub fn delete_delay(mut self, delay: Duration) -> Self {
        self.delete_delay = delay;
        self
    }
}

#[async_trait]
impl ObjectStore for SlowStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), ObjectStoreError> {
        tokio::time::sleep(self.put_delay).await;
        self.inner.put(key, data).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        tokio::time::sleep(self.get_delay).await;
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        tokio::time::sleep(self.delete_delay).await;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        self.inner.exists(key).await
    }
}

/// Open an engine over a [`SlowStore`] laid out like `StorageEngine::open`.
pub async fn slow_engine(
    dir: &tempfile::TempDir,
    configure: impl FnOnce(SlowStore) -> SlowStore,
) -> Arc<StorageEngine> {
    let storage_dir = dir.path().join("data");
    std::fs::create_dir_all(&storage_dir).unwrap();
    let store = configure(SlowStore::new(&storage_dir.join(FILES_DIR)));
    let engine = StorageEngine::with_store(Arc::new(store), storage_dir.join(SNAPSHOT_FILE)).await;
    Arc::new(engine)
}
