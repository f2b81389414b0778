mod local;

pub use local::{LocalStore, STAGING_DIR};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Object already exists: {0}")]
    AlreadyExists(String),
}

/// Abstraction over blob byte storage.
/// Keys are stored names -- the index decides which keys are live.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under a new key. All-or-nothing: on error no object is
    /// left behind, and an existing object is never overwritten.
    async fn put(&self, key: &str, data: Bytes) -> Result<(), ObjectStoreError>;
    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError>;
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError>;
}
