pub mod engine;
pub mod index;
pub mod snapshot;

pub use engine::{StorageEngine, FILES_DIR, SNAPSHOT_FILE};
pub use index::{Deletion, FileIdentifier, FileIndex, IndexEntry, IndexError, Reservation};
pub use snapshot::{IndexSnapshot, SNAPSHOT_VERSION};

use thiserror::Error;

use crate::object_store::ObjectStoreError;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Invalid file name: {0:?}")]
    InvalidName(String),
    #[error("Corrupt index: {0}")]
    CorruptIndex(IndexError),
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),
    #[error("Unsupported snapshot version: {0}")]
    SnapshotVersion(u32),
}

impl From<IndexError> for StorageError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::DuplicateName(name) => StorageError::Forbidden(name),
            IndexError::NotFound(what) | IndexError::InvalidIdentifier(what) => {
                StorageError::NotFound(what)
            }
            e @ (IndexError::DuplicateId(_) | IndexError::IdsExhausted) => {
                StorageError::CorruptIndex(e)
            }
        }
    }
}

impl From<ObjectStoreError> for StorageError {
    fn from(e: ObjectStoreError) -> Self {
        match e {
            ObjectStoreError::NotFound(key) => StorageError::NotFound(key),
            ObjectStoreError::AlreadyExists(key) => StorageError::Forbidden(key),
            ObjectStoreError::Io(e) => StorageError::Io(e),
        }
    }
}
