//! Versioned on-disk record of the file index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::AsyncWriteExt;

use super::index::{FileIndex, IndexEntry, IndexError};
use super::StorageError;

/// Newest snapshot layout this build reads and writes.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Serialized form of a [`FileIndex`], MessagePack with named fields so new
/// optional fields can be added without breaking older snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub next_id: u64,
    pub entries: Vec<IndexEntry>,
}

impl IndexSnapshot {
    pub fn capture(index: &FileIndex) -> Self {
        let (next_id, entries) = index.export();
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            next_id,
            entries,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, StorageError> {
        let snapshot: Self = rmp_serde::from_slice(data)?;
        if snapshot.version == 0 || snapshot.version > SNAPSHOT_VERSION {
            return Err(StorageError::SnapshotVersion(snapshot.version));
        }
        Ok(snapshot)
    }

    pub fn into_index(self) -> Result<FileIndex, IndexError> {
        FileIndex::from_entries(self.next_id, self.entries)
    }

    /// Read a snapshot file; `Ok(None)` when it does not exist.
    pub async fn read(path: &Path) -> Result<Option<Self>, StorageError> {
        match tokio::fs::read(path).await {
            Ok(data) => Self::decode(&data).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write through a temp file and rename so a crash never leaves a torn
    /// snapshot behind.
    pub async fn write_atomic(&self, path: &Path) -> Result<(), StorageError> {
        let data = self.encode()?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "snapshot".to_string());
        let tmp_path = path.with_file_name(format!("{file_name}.{}.tmp", uuid::Uuid::new_v4()));

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let written = async {
            file.write_all(&data).await?;
            file.sync_data().await
        }
        .await;
        drop(file);

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}
