use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use super::{ObjectStore, ObjectStoreError};

/// Directory under the base path where in-progress writes live.
pub const STAGING_DIR: &str = ".staging";

/// Local filesystem object store: one regular file per key.
pub struct LocalStore {
    base_path: PathBuf,
    staging_path: PathBuf,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, std::io::Error> {
        let base_path = base_path.as_ref().to_path_buf();
        let staging_path = base_path.join(STAGING_DIR);
        std::fs::create_dir_all(&staging_path)?;
        Ok(Self {
            base_path,
            staging_path,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    async fn is_regular_file(path: &Path) -> Result<bool, std::io::Error> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn not_found_or_io(key: &str, e: std::io::Error) -> ObjectStoreError {
    if e.kind() == ErrorKind::NotFound {
        ObjectStoreError::NotFound(key.to_string())
    } else {
        ObjectStoreError::Io(e)
    }
}

/// Removes a staged file when dropped, whether the write finished or not.
struct StagedFile {
    path: PathBuf,
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), ObjectStoreError> {
        let staged = StagedFile {
            path: self
                .staging_path
                .join(format!("{}.tmp", uuid::Uuid::new_v4())),
        };

        let mut file = tokio::fs::File::create(&staged.path).await?;
        file.write_all(&data).await?;
        file.sync_data().await?;
        drop(file);

        // hard_link refuses to replace an existing target, which rename would not
        match tokio::fs::hard_link(&staged.path, self.object_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(ObjectStoreError::AlreadyExists(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        let path = self.object_path(key);
        if !Self::is_regular_file(&path).await? {
            return Err(ObjectStoreError::NotFound(key.to_string()));
        }
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| not_found_or_io(key, e))?;
        Ok(Bytes::from(data))
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let path = self.object_path(key);
        if !Self::is_regular_file(&path).await? {
            return Err(ObjectStoreError::NotFound(key.to_string()));
        }
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| not_found_or_io(key, e))
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        Ok(Self::is_regular_file(&self.object_path(key)).await?)
    }
}
